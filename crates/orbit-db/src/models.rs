/// Row types that live outside the document store.

pub struct CredentialRow {
    pub user_id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}
