use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (accounts, channels, messages)");
        conn.execute_batch(
            "
            CREATE TABLE accounts (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL
            );

            -- One row per element of an account's friends / pending sets.
            CREATE TABLE account_relations (
                account_id  TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                set_name    TEXT NOT NULL
                            CHECK (set_name IN ('friends', 'sent_pending', 'received_pending')),
                other_id    TEXT NOT NULL,
                PRIMARY KEY (account_id, set_name, other_id)
            );

            CREATE INDEX idx_relations_other ON account_relations(other_id);

            CREATE TABLE channels (
                channel_key             TEXT PRIMARY KEY,
                kind                    TEXT NOT NULL,
                name                    TEXT,
                owner_id                TEXT,
                capture_history         INTEGER NOT NULL,
                has_exchanged_message   INTEGER NOT NULL DEFAULT 0,
                created_at              TEXT NOT NULL
            );

            -- rowid order doubles as join order, used for owner succession.
            CREATE TABLE channel_members (
                channel_key TEXT NOT NULL REFERENCES channels(channel_key)
                            ON UPDATE CASCADE ON DELETE CASCADE,
                role        TEXT NOT NULL CHECK (role IN ('member', 'admin')),
                account_id  TEXT NOT NULL,
                UNIQUE (channel_key, role, account_id)
            );

            CREATE INDEX idx_members_account ON channel_members(account_id, role);

            -- Message ids are client-chosen dedup tokens, unique per channel only.
            CREATE TABLE messages (
                id          TEXT NOT NULL,
                channel_key TEXT NOT NULL REFERENCES channels(channel_key)
                            ON UPDATE CASCADE ON DELETE CASCADE,
                author_id   TEXT NOT NULL,
                body        TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (channel_key, id)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
