use uuid::Uuid;

/// Eight hex characters, used for minted branch ids.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Message ids.
pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}
