use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            collection  TEXT NOT NULL,
            id          TEXT NOT NULL,
            data        TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_created
            ON documents(collection, json_extract(data, '$.created_at'));

        -- One conversation per participant pair
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_pair
            ON documents(json_extract(data, '$.pair_key'))
            WHERE collection = 'conversations';

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON documents(json_extract(data, '$.conversation_id'))
            WHERE collection = 'messages';

        CREATE INDEX IF NOT EXISTS idx_notifications_user
            ON documents(json_extract(data, '$.user_id'))
            WHERE collection = 'notifications';

        -- Password hashes live outside the document space so they can never
        -- leak through a query or snapshot.
        CREATE TABLE IF NOT EXISTS credentials (
            user_id     TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
