use artforge_core::UserId;

/// The authenticated caller, derived from the bearer token.
///
/// Inserted by the auth middleware; every protected handler reads it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: UserId,
}

impl UserContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
