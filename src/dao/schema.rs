use rusqlite::Connection;

use super::storage::StorageResult;

/// Create every table and index the pipeline relies on. Safe to re-run.
pub fn migrate(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            postal_address TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS games (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            game_type TEXT NOT NULL,
            turn_duration_hours INTEGER NOT NULL CHECK (turn_duration_hours > 0),
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS game_instances (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL REFERENCES games(id),
            state TEXT NOT NULL,
            current_turn_number INTEGER NOT NULL DEFAULT 0 CHECK (current_turn_number >= 0),
            required_player_count INTEGER NOT NULL,
            turn_limit INTEGER,
            turn_phase TEXT NOT NULL DEFAULT 'opening',
            deadline_for_current_turn INTEGER,
            game_state TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS game_subscriptions (
            id TEXT PRIMARY KEY,
            game_instance_id TEXT NOT NULL REFERENCES game_instances(id),
            account_id TEXT NOT NULL REFERENCES accounts(id),
            status TEXT NOT NULL,
            delivery_channels TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (game_instance_id, account_id)
        );

        CREATE TABLE IF NOT EXISTS turn_sheets (
            id TEXT PRIMARY KEY,
            game_instance_id TEXT NOT NULL REFERENCES game_instances(id),
            turn_number INTEGER NOT NULL,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            game_subscription_id TEXT NOT NULL REFERENCES game_subscriptions(id),
            sheet_type TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            state TEXT NOT NULL,
            template_data TEXT NOT NULL,
            rendered_digest TEXT,
            scanned_data TEXT,
            deadline INTEGER NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (game_instance_id, turn_number, account_id, sheet_type)
        );

        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id TEXT PRIMARY KEY,
            turn_sheet_id TEXT NOT NULL REFERENCES turn_sheets(id),
            channel TEXT NOT NULL,
            attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
            state TEXT NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (turn_sheet_id, channel, attempt_number)
        );

        CREATE TABLE IF NOT EXISTS scan_records (
            id TEXT PRIMARY KEY,
            image BLOB NOT NULL,
            source TEXT NOT NULL,
            sheet_type_hint TEXT,
            submission INTEGER NOT NULL DEFAULT 1,
            state TEXT NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            code TEXT,
            turn_sheet_id TEXT REFERENCES turn_sheets(id),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            natural_key TEXT NOT NULL UNIQUE,
            payload TEXT NOT NULL,
            instance_id TEXT,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            run_after INTEGER NOT NULL,
            lease_expires_at INTEGER,
            lease_token TEXT,
            wake INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_delivery_attempts_one_success
            ON delivery_attempts (turn_sheet_id, channel) WHERE state = 'succeeded';
        CREATE INDEX IF NOT EXISTS idx_turn_sheets_turn
            ON turn_sheets (game_instance_id, turn_number);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_instance
            ON game_subscriptions (game_instance_id);
        CREATE INDEX IF NOT EXISTS idx_scan_records_state ON scan_records (state);
        CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs (state, run_after);
        ",
    )?;
    Ok(())
}
