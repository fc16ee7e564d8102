use std::path::PathBuf;
use std::time::{Duration, Instant};

use color_eyre::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Paragraph};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::chart::mask_streaming_charts;
use crate::command::Command;
use crate::context::DataContext;
use crate::conversation::{ChatState, ChatTurn, Role, TurnKind};
use crate::render::{Segment, THINKING_HEADER, THINKING_PENDING_HEADER, split_segments};
use crate::session::{ChatSession, ContextChange, RequestOutcome, spawn_request};

const SCROLL_THROTTLE: Duration = Duration::from_millis(80);
const INPUT_POLL: Duration = Duration::from_millis(40);
const TYPING_CURSOR: &str = "▌";

/// Trailing-edge throttle: any number of requests inside one window collapse
/// into a single firing at the end of that window.
#[derive(Debug)]
pub struct ScrollThrottle {
    gap: Duration,
    deadline: Option<Instant>,
}

impl ScrollThrottle {
    pub fn new(gap: Duration) -> Self {
        ScrollThrottle {
            gap,
            deadline: None,
        }
    }

    pub fn request(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.gap);
        }
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Splits `text` into rows no wider than `width` terminal cells.
pub fn wrap_line(text: &str, width: usize) -> Vec<String> {
    if width == 0 || text.width() <= width {
        return vec![text.to_string()];
    }
    let mut rows = Vec::new();
    let mut current = String::new();
    let mut current_width = 0;
    for ch in text.chars() {
        let ch_width = ch.width().unwrap_or(0);
        if current_width + ch_width > width && !current.is_empty() {
            rows.push(std::mem::take(&mut current));
            current_width = 0;
        }
        current.push(ch);
        current_width += ch_width;
    }
    if !current.is_empty() {
        rows.push(current);
    }
    rows
}

/// Logical (unwrapped) display rows for one turn.
fn turn_rows(turn: &ChatTurn) -> Vec<(String, Style)> {
    let mut rows = Vec::new();
    let (title, title_style) = match (turn.role(), turn.kind()) {
        (Role::User, _) => ("你", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        (_, TurnKind::Notice) => ("提示", Style::default().fg(Color::Yellow)),
        (_, TurnKind::Diagnostic) => ("错误", Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)),
        (Role::Assistant, TurnKind::Message) => {
            ("AI", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
        }
    };
    rows.push((
        format!("{title} · {}", turn.timestamp().format("%H:%M:%S")),
        title_style,
    ));

    let body_style = match turn.kind() {
        TurnKind::Diagnostic => Style::default().fg(Color::LightRed),
        _ => Style::default(),
    };
    let streaming = turn.is_streaming();
    let content = if streaming {
        mask_streaming_charts(turn.content())
    } else {
        turn.content().into()
    };
    match turn.role() {
        Role::User => {
            for line in content.lines() {
                rows.push((line.to_string(), body_style));
            }
        }
        Role::Assistant => {
            for segment in split_segments(&content, streaming) {
                match segment {
                    Segment::Markdown(text) => {
                        for line in text.trim_matches('\n').lines() {
                            rows.push((line.to_string(), body_style));
                        }
                    }
                    Segment::Thinking { text, complete } => {
                        let header = if complete {
                            THINKING_HEADER
                        } else {
                            THINKING_PENDING_HEADER
                        };
                        let dim = Style::default()
                            .fg(Color::DarkGray)
                            .add_modifier(Modifier::ITALIC);
                        rows.push((header.to_string(), dim));
                        for line in text.trim().lines() {
                            rows.push((format!("│ {line}"), dim));
                        }
                    }
                }
            }
        }
    }
    if let Some(chart) = turn.chart() {
        rows.push((
            format!("  {}", chart.brief()),
            Style::default().fg(Color::LightGreen),
        ));
    }
    if streaming {
        if rows.len() > 1 {
            if let Some((last, _)) = rows.last_mut() {
                last.push_str(TYPING_CURSOR);
            }
        } else {
            rows.push((TYPING_CURSOR.to_string(), body_style));
        }
    }
    rows.push((String::new(), Style::default()));
    rows
}

pub struct ChatApp {
    session: ChatSession,
    contexts: Vec<DataContext>,
    context_idx: usize,
    input: String,
    scroll_from_bottom: usize,
    follow_bottom: bool,
    scroll_throttle: ScrollThrottle,
    page_height: usize,
    last_draw: Instant,
    min_redraw_gap: Duration,
    dirty: bool,
    status_message: Option<String>,
    status_visible_until: Option<Instant>,
    status_is_error: bool,
    tx: UnboundedSender<Command>,
    export_path: PathBuf,
}

impl ChatApp {
    pub fn new(
        session: ChatSession,
        contexts: Vec<DataContext>,
        tx: UnboundedSender<Command>,
        export_path: PathBuf,
    ) -> Self {
        let min_redraw_gap = Duration::from_millis(50);
        let mut app = ChatApp {
            session,
            contexts,
            context_idx: 0,
            input: String::new(),
            scroll_from_bottom: 0,
            follow_bottom: true,
            scroll_throttle: ScrollThrottle::new(SCROLL_THROTTLE),
            page_height: 10,
            last_draw: Instant::now() - min_redraw_gap,
            min_redraw_gap,
            dirty: true,
            status_message: None,
            status_visible_until: None,
            status_is_error: false,
            tx,
            export_path,
        };
        match app.session.check_ready() {
            Ok(()) => app.set_status_message(format!(
                "{} · Enter 发送 · Esc 停止 · Ctrl-R 重新生成 · Tab 切换数据 · Ctrl-E 导出 · Ctrl-C 退出",
                app.session.settings().backend_label()
            )),
            Err(err) => app.set_error_status_message(err.to_string()),
        }
        app
    }

    fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
        self.status_visible_until = Some(Instant::now() + Duration::from_secs(4));
        self.status_is_error = false;
        self.dirty = true;
    }

    fn set_error_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
        self.status_visible_until = Some(Instant::now() + Duration::from_secs(6));
        self.status_is_error = true;
        self.dirty = true;
    }

    fn clear_status_if_allowed(&mut self) {
        if let Some(visible_until) = self.status_visible_until
            && Instant::now() >= visible_until
        {
            self.status_message = None;
            self.status_visible_until = None;
            self.status_is_error = false;
            self.dirty = true;
        }
    }

    pub async fn run(&mut self, rx: &mut UnboundedReceiver<Command>) -> Result<()> {
        color_eyre::install()?;
        let mut terminal = ratatui::init();
        let result = self.event_loop(&mut terminal, rx).await;
        ratatui::restore();
        result
    }

    async fn event_loop(
        &mut self,
        terminal: &mut ratatui::DefaultTerminal,
        rx: &mut UnboundedReceiver<Command>,
    ) -> Result<()> {
        let mut input_tick = tokio::time::interval(INPUT_POLL);
        terminal.draw(|frame| self.render(frame))?;
        self.last_draw = Instant::now();
        self.dirty = false;
        loop {
            tokio::select! {
                biased;
                _ = input_tick.tick() => {
                    if self.poll_input()? {
                        return Ok(());
                    }
                    if self.scroll_throttle.poll(Instant::now()) && self.follow_bottom {
                        self.scroll_from_bottom = 0;
                        self.dirty = true;
                    }
                    self.clear_status_if_allowed();
                }
                command = rx.recv() => match command {
                    Some(Command::Delta(turn_id, delta)) => {
                        if self.session.apply_delta(turn_id, &delta) {
                            self.scroll_throttle.request(Instant::now());
                            self.dirty = true;
                        }
                    }
                    Some(Command::Finished(turn_id, result)) => {
                        let outcome = self.session.complete(turn_id, result);
                        self.on_finished(outcome);
                    }
                    None => return Ok(()),
                }
            }
            if self.dirty && self.last_draw.elapsed() >= self.min_redraw_gap {
                terminal.draw(|frame| self.render(frame))?;
                self.last_draw = Instant::now();
                self.dirty = false;
            }
        }
    }

    fn on_finished(&mut self, outcome: Option<RequestOutcome>) {
        match outcome {
            Some(RequestOutcome::Completed { has_chart: true }) => {
                self.set_status_message("回答完成，已生成图表")
            }
            Some(RequestOutcome::Completed { has_chart: false }) => {
                self.set_status_message("回答完成")
            }
            Some(RequestOutcome::Failed) => self.set_error_status_message("请求失败，详情见对话"),
            Some(RequestOutcome::Stopped) | None => {}
        }
        self.scroll_throttle.request(Instant::now());
        self.dirty = true;
    }

    fn poll_input(&mut self) -> Result<bool> {
        while event::poll(Duration::from_millis(0))? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if self.handle_key_event(key) {
                        return Ok(true);
                    }
                    self.dirty = true;
                }
                Event::Resize(_, _) => self.dirty = true,
                _ => {}
            }
        }
        Ok(false)
    }

    fn handle_key_event(&mut self, key: KeyEvent) -> bool {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') if ctrl => return true,
            KeyCode::Char('r') if ctrl => self.regenerate(),
            KeyCode::Char('e') if ctrl => self.export(),
            KeyCode::Enter => self.submit(),
            KeyCode::Esc => {
                if self.session.stop() {
                    self.set_status_message("已停止输出");
                }
            }
            KeyCode::Tab => self.next_context(),
            KeyCode::PageUp => self.scroll_up(self.page_height.max(1)),
            KeyCode::PageDown => self.scroll_down(self.page_height.max(1)),
            KeyCode::Up => self.scroll_up(1),
            KeyCode::Down => self.scroll_down(1),
            KeyCode::End => {
                self.follow_bottom = true;
                self.scroll_from_bottom = 0;
            }
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Char(ch) if !ctrl => self.input.push(ch),
            _ => {}
        }
        false
    }

    fn submit(&mut self) {
        match self.session.prepare_send(&self.input) {
            Ok(pending) => {
                spawn_request(self.session.client(), pending, self.tx.clone());
                self.input.clear();
                self.follow_bottom = true;
                self.scroll_throttle.request(Instant::now());
            }
            Err(rejection) => self.set_error_status_message(rejection.to_string()),
        }
    }

    fn regenerate(&mut self) {
        let Some(turn_id) = self
            .session
            .conversation()
            .last_regenerable()
            .map(|turn| turn.id())
        else {
            self.set_error_status_message("没有可以重新生成的回答");
            return;
        };
        match self.session.prepare_regenerate(turn_id) {
            Ok(pending) => {
                spawn_request(self.session.client(), pending, self.tx.clone());
                self.follow_bottom = true;
                self.scroll_throttle.request(Instant::now());
            }
            Err(rejection) => self.set_error_status_message(rejection.to_string()),
        }
    }

    fn next_context(&mut self) {
        if self.contexts.len() < 2 {
            self.set_status_message("只有一份数据，无法切换");
            return;
        }
        self.context_idx = (self.context_idx + 1) % self.contexts.len();
        let context = self.contexts[self.context_idx].clone();
        let name = context.display_name().to_string();
        match self.session.set_context(context) {
            ContextChange::Unchanged => self.set_status_message(format!("仍在讨论「{name}」")),
            ContextChange::Switched { interrupted } => {
                self.follow_bottom = true;
                self.scroll_from_bottom = 0;
                if interrupted {
                    self.set_status_message(format!("已停止上一条回答并切换到「{name}」"));
                } else {
                    self.set_status_message(format!("已切换到「{name}」"));
                }
            }
        }
    }

    fn export(&mut self) {
        let path = self.export_path.clone();
        match self.session.export_html(&path) {
            Ok(()) => self.set_status_message(format!("对话已导出到 {}", path.display())),
            Err(err) => self.set_error_status_message(format!("导出失败: {err:#}")),
        }
    }

    fn scroll_up(&mut self, rows: usize) {
        self.follow_bottom = false;
        self.scroll_from_bottom = self.scroll_from_bottom.saturating_add(rows);
    }

    fn scroll_down(&mut self, rows: usize) {
        self.scroll_from_bottom = self.scroll_from_bottom.saturating_sub(rows);
        if self.scroll_from_bottom == 0 {
            self.follow_bottom = true;
        }
    }

    fn render(&mut self, frame: &mut Frame) {
        let area = frame.area();
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(3),
                Constraint::Length(3),
                Constraint::Length(1),
            ])
            .split(area);
        self.render_header(frame, chunks[0]);
        self.render_conversation(frame, chunks[1]);
        self.render_input(frame, chunks[2]);
        self.render_status(frame, chunks[3]);
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let context = self.session.context();
        let mut spans = vec![
            Span::styled(
                context.display_name().to_string(),
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            ),
            Span::raw(format!(" · {}", context.display_kind())),
        ];
        if let Some(period) = context.period_label() {
            spans.push(Span::raw(format!(" · {period}")));
        }
        if self.contexts.len() > 1 {
            spans.push(Span::styled(
                format!("  [{}/{}]", self.context_idx + 1, self.contexts.len()),
                Style::default().fg(Color::DarkGray),
            ));
        }
        let state = match self.session.state() {
            ChatState::Streaming(_) => Span::styled("  ● 回复中", Style::default().fg(Color::Yellow)),
            ChatState::Idle => Span::styled("  ○ 空闲", Style::default().fg(Color::DarkGray)),
        };
        spans.push(state);
        let block = Block::bordered().title(format!(
            "Ask AI · {}",
            self.session.settings().backend_label()
        ));
        frame.render_widget(Paragraph::new(Line::from(spans)).block(block), area);
    }

    fn render_conversation(&mut self, frame: &mut Frame, area: Rect) {
        let block = Block::bordered().title("对话");
        let inner = block.inner(area);
        let width = inner.width as usize;
        let height = inner.height as usize;
        self.page_height = height.saturating_sub(1);

        let mut rows: Vec<Line<'static>> = Vec::new();
        for turn in self.session.conversation().turns() {
            if turn.role() == Role::Assistant
                && !turn.is_streaming()
                && turn.content().trim().is_empty()
                && !turn.has_chart()
            {
                continue;
            }
            for (text, style) in turn_rows(turn) {
                for row in wrap_line(&text, width) {
                    rows.push(Line::styled(row, style));
                }
            }
        }
        let max_scroll = rows.len().saturating_sub(height);
        self.scroll_from_bottom = self.scroll_from_bottom.min(max_scroll);
        let top = max_scroll - self.scroll_from_bottom;
        let visible: Vec<Line<'static>> = rows.into_iter().skip(top).take(height).collect();
        frame.render_widget(block, area);
        frame.render_widget(Paragraph::new(visible), inner);
    }

    fn render_input(&self, frame: &mut Frame, area: Rect) {
        let title = if self.session.is_streaming() {
            "输入问题 (Esc 停止当前回答)"
        } else {
            "输入问题 (Enter 发送)"
        };
        let block = Block::bordered().title(title);
        let inner_width = block.inner(area).width as usize;
        let text = format!("{}{}", self.input, TYPING_CURSOR);
        let overflow = text.width().saturating_sub(inner_width);
        let visible = skip_width(&text, overflow);
        frame.render_widget(
            Paragraph::new(visible.to_string())
                .alignment(Alignment::Left)
                .block(block),
            area,
        );
    }

    fn render_status(&self, frame: &mut Frame, area: Rect) {
        if let Some(message) = &self.status_message {
            let color = if self.status_is_error {
                Color::Red
            } else {
                Color::Yellow
            };
            frame.render_widget(
                Paragraph::new(message.as_str()).style(Style::default().fg(color)),
                area,
            );
        }
    }
}

/// Drops leading characters until at least `cells` terminal cells are skipped.
fn skip_width(text: &str, cells: usize) -> &str {
    let mut skipped = 0;
    for (idx, ch) in text.char_indices() {
        if skipped >= cells {
            return &text[idx..];
        }
        skipped += ch.width().unwrap_or(0);
    }
    ""
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Conversation, FinishKind};

    #[test]
    fn throttle_coalesces_requests_into_one_trailing_fire() {
        let start = Instant::now();
        let mut throttle = ScrollThrottle::new(SCROLL_THROTTLE);
        throttle.request(start);
        throttle.request(start + Duration::from_millis(30));
        throttle.request(start + Duration::from_millis(70));
        assert!(!throttle.poll(start + Duration::from_millis(79)));
        assert!(throttle.poll(start + Duration::from_millis(80)));
        assert!(!throttle.poll(start + Duration::from_millis(200)));
        assert!(!throttle.is_pending());

        throttle.request(start + Duration::from_millis(300));
        assert!(throttle.is_pending());
        assert!(throttle.poll(start + Duration::from_millis(400)));
    }

    #[test]
    fn wrap_respects_double_width_characters() {
        assert_eq!(wrap_line("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(wrap_line("上证指数上涨", 5), vec!["上证", "指数", "上涨"]);
        assert_eq!(wrap_line("", 10), vec![""]);
        assert_eq!(wrap_line("abc", 0), vec!["abc"]);
    }

    #[test]
    fn skip_width_trims_from_the_left() {
        assert_eq!(skip_width("abcdef", 2), "cdef");
        assert_eq!(skip_width("上证指数", 3), "指数");
        assert_eq!(skip_width("ab", 5), "");
        assert_eq!(skip_width("ab", 0), "ab");
    }

    #[test]
    fn streaming_turn_shows_cursor_and_pending_thinking() {
        let mut conversation = Conversation::new();
        let id = conversation.begin_exchange("q").unwrap();
        conversation.append_delta(id, "<think>考虑均线");
        let rows = turn_rows(conversation.get(id).unwrap());
        let texts: Vec<&str> = rows.iter().map(|(text, _)| text.as_str()).collect();
        assert!(texts.contains(&THINKING_PENDING_HEADER));
        assert!(texts.iter().any(|text| text.ends_with(TYPING_CURSOR)));

        conversation.finalize(id, FinishKind::Completed);
        let rows = turn_rows(conversation.get(id).unwrap());
        assert!(rows.iter().all(|(text, _)| !text.contains(TYPING_CURSOR)));
        assert!(rows.iter().all(|(text, _)| text != THINKING_PENDING_HEADER));
    }
}
