//! Schema creation. Idempotent; runs at every open.

use rusqlite::Connection;

use super::StoreError;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            pubkey       TEXT PRIMARY KEY,
            metadata     TEXT NOT NULL DEFAULT '{}',
            settings     TEXT NOT NULL DEFAULT '{}',
            onboarding   TEXT NOT NULL DEFAULT '{}',
            last_used    INTEGER NOT NULL DEFAULT 0,
            last_synced  INTEGER NOT NULL DEFAULT 0,
            active       INTEGER NOT NULL DEFAULT 0
        );

        -- At most one active account at a time.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_single_active
            ON accounts(active) WHERE active = 1;

        -- Local signing material. Lives next to the data it unlocks; a
        -- platform keychain can replace this table behind the same API.
        CREATE TABLE IF NOT EXISTS account_secrets (
            pubkey  TEXT PRIMARY KEY
                REFERENCES accounts(pubkey) ON DELETE CASCADE,
            secret  TEXT NOT NULL
        );

        -- Serialized engine state (MLS groups, signing identity, exporter
        -- secrets), one blob per account, rewritten after every mutating
        -- engine operation.
        CREATE TABLE IF NOT EXISTS engine_state (
            account_pubkey  TEXT PRIMARY KEY
                REFERENCES accounts(pubkey) ON DELETE CASCADE,
            state           BLOB NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS account_relays (
            url             TEXT NOT NULL,
            purpose         TEXT NOT NULL,
            account_pubkey  TEXT NOT NULL
                REFERENCES accounts(pubkey) ON DELETE CASCADE,
            PRIMARY KEY (url, account_pubkey)
        );

        CREATE TABLE IF NOT EXISTS groups (
            mls_group_id     TEXT NOT NULL,
            account_pubkey   TEXT NOT NULL
                REFERENCES accounts(pubkey) ON DELETE CASCADE,
            nostr_group_id   TEXT NOT NULL,
            name             TEXT NOT NULL,
            description      TEXT NOT NULL DEFAULT '',
            admin_pubkeys    TEXT NOT NULL DEFAULT '[]',
            epoch            INTEGER NOT NULL DEFAULT 0,
            state            TEXT NOT NULL DEFAULT 'active',
            last_message_id  TEXT,
            last_message_at  INTEGER,
            group_type       TEXT NOT NULL DEFAULT 'group',
            PRIMARY KEY (mls_group_id, account_pubkey)
        );

        CREATE INDEX IF NOT EXISTS idx_groups_transport
            ON groups(nostr_group_id, account_pubkey);

        CREATE TABLE IF NOT EXISTS group_relays (
            url             TEXT NOT NULL,
            purpose         TEXT NOT NULL,
            mls_group_id    TEXT NOT NULL,
            account_pubkey  TEXT NOT NULL,
            PRIMARY KEY (url, mls_group_id, account_pubkey),
            FOREIGN KEY (mls_group_id, account_pubkey)
                REFERENCES groups(mls_group_id, account_pubkey)
                ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS invites (
            event_id              TEXT PRIMARY KEY,
            account_pubkey        TEXT NOT NULL
                REFERENCES accounts(pubkey) ON DELETE CASCADE,
            event                 TEXT NOT NULL,
            mls_group_id          TEXT NOT NULL,
            nostr_group_id        TEXT NOT NULL,
            group_name            TEXT NOT NULL,
            group_description     TEXT NOT NULL DEFAULT '',
            group_admin_pubkeys   TEXT NOT NULL DEFAULT '[]',
            group_relays          TEXT NOT NULL DEFAULT '[]',
            inviter               TEXT NOT NULL,
            member_count          INTEGER NOT NULL DEFAULT 0,
            state                 TEXT NOT NULL DEFAULT 'pending',
            outer_event_id        TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_invites_account_state
            ON invites(account_pubkey, state);

        CREATE TABLE IF NOT EXISTS processed_invites (
            event_id         TEXT NOT NULL,
            account_pubkey   TEXT NOT NULL,
            invite_event_id  TEXT,
            processed_at     INTEGER NOT NULL,
            state            TEXT NOT NULL,
            failure_reason   TEXT,
            PRIMARY KEY (event_id, account_pubkey)
        );

        CREATE TABLE IF NOT EXISTS messages (
            event_id        TEXT NOT NULL,
            account_pubkey  TEXT NOT NULL
                REFERENCES accounts(pubkey) ON DELETE CASCADE,
            mls_group_id    TEXT NOT NULL,
            author_pubkey   TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            content         TEXT NOT NULL,
            tags            TEXT NOT NULL DEFAULT '[]',
            event           TEXT NOT NULL,
            outer_event_id  TEXT,
            PRIMARY KEY (event_id, account_pubkey)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_group_time
            ON messages(mls_group_id, account_pubkey, created_at);

        CREATE TABLE IF NOT EXISTS processed_messages (
            event_id          TEXT NOT NULL,
            account_pubkey    TEXT NOT NULL,
            message_event_id  TEXT,
            processed_at      INTEGER NOT NULL,
            state             TEXT NOT NULL,
            failure_reason    TEXT,
            PRIMARY KEY (event_id, account_pubkey)
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            content,
            content='messages',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS messages_fts_insert
        AFTER INSERT ON messages BEGIN
            INSERT INTO messages_fts(rowid, content)
            VALUES (new.rowid, new.content);
        END;

        CREATE TRIGGER IF NOT EXISTS messages_fts_update
        AFTER UPDATE OF content ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, content)
            VALUES ('delete', old.rowid, old.content);
            INSERT INTO messages_fts(rowid, content)
            VALUES (new.rowid, new.content);
        END;

        CREATE TRIGGER IF NOT EXISTS messages_fts_delete
        AFTER DELETE ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, content)
            VALUES ('delete', old.rowid, old.content);
        END;
        ",
    )?;
    Ok(())
}
