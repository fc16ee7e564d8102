use crate::conversation::TurnId;
use crate::error::ChatError;

/// Events delivered to the session owner from request tasks.
#[derive(Debug)]
pub enum Command {
    Delta(TurnId, String),
    Finished(TurnId, Result<(), ChatError>),
}
