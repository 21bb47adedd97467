//! SQLite persistence for server and channel configuration.
//!
//! Read at handshake-completion time (the auto-join list) and written
//! only by explicit configuration actions, never by the event
//! dispatcher.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

use crate::state::ServerId;

/// A configured server: identity plus credentials.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub id: ServerId,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub nick: String,
    pub username: String,
    pub realname: String,
    /// Server password, sent as PASS before NICK/USER.
    pub password: Option<String>,
    /// SASL PLAIN credentials. Both set, or SASL is skipped.
    pub sasl_user: Option<String>,
    pub sasl_pass: Option<String>,
}

/// A channel remembered for a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub server: ServerId,
    pub name: String,
    /// Joined automatically after registration completes.
    pub autojoin: bool,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS servers (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                host      TEXT NOT NULL,
                port      INTEGER NOT NULL,
                tls       INTEGER NOT NULL DEFAULT 0,
                nick      TEXT NOT NULL,
                username  TEXT NOT NULL,
                realname  TEXT NOT NULL,
                password  TEXT,
                sasl_user TEXT,
                sasl_pass TEXT
            );

            CREATE TABLE IF NOT EXISTS channels (
                server_id INTEGER NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                name      TEXT NOT NULL,
                autojoin  INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (server_id, name)
            );
            ",
        )
    }

    /// Insert a server record; the id field of the input is ignored and
    /// the assigned id returned.
    pub fn add_server(&self, record: &ServerRecord) -> SqlResult<ServerId> {
        self.conn.execute(
            "INSERT INTO servers (host, port, tls, nick, username, realname, password, sasl_user, sasl_pass)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.host,
                record.port,
                record.tls,
                record.nick,
                record.username,
                record.realname,
                record.password,
                record.sasl_user,
                record.sasl_pass,
            ],
        )?;
        Ok(ServerId(self.conn.last_insert_rowid()))
    }

    pub fn update_server(&self, record: &ServerRecord) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE servers SET host=?2, port=?3, tls=?4, nick=?5, username=?6,
                    realname=?7, password=?8, sasl_user=?9, sasl_pass=?10
             WHERE id=?1",
            params![
                record.id.0,
                record.host,
                record.port,
                record.tls,
                record.nick,
                record.username,
                record.realname,
                record.password,
                record.sasl_user,
                record.sasl_pass,
            ],
        )?;
        Ok(())
    }

    /// Delete a server; its channels go with it.
    pub fn delete_server(&self, id: ServerId) -> SqlResult<()> {
        self.conn
            .execute("DELETE FROM servers WHERE id=?1", params![id.0])?;
        Ok(())
    }

    pub fn get_server(&self, id: ServerId) -> SqlResult<Option<ServerRecord>> {
        self.conn
            .query_row(
                "SELECT id, host, port, tls, nick, username, realname, password, sasl_user, sasl_pass
                 FROM servers WHERE id=?1",
                params![id.0],
                row_to_server,
            )
            .optional()
    }

    pub fn list_servers(&self) -> SqlResult<Vec<ServerRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, host, port, tls, nick, username, realname, password, sasl_user, sasl_pass
             FROM servers ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_server)?;
        rows.collect()
    }

    /// Insert or update a remembered channel.
    pub fn save_channel(&self, record: &ChannelRecord) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO channels (server_id, name, autojoin) VALUES (?1, ?2, ?3)
             ON CONFLICT (server_id, name) DO UPDATE SET autojoin=?3",
            params![record.server.0, record.name.to_lowercase(), record.autojoin],
        )?;
        Ok(())
    }

    pub fn delete_channel(&self, server: ServerId, name: &str) -> SqlResult<()> {
        self.conn.execute(
            "DELETE FROM channels WHERE server_id=?1 AND name=?2",
            params![server.0, name.to_lowercase()],
        )?;
        Ok(())
    }

    pub fn list_channels(&self, server: ServerId) -> SqlResult<Vec<ChannelRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT server_id, name, autojoin FROM channels WHERE server_id=?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![server.0], |row| {
            Ok(ChannelRecord {
                server: ServerId(row.get(0)?),
                name: row.get(1)?,
                autojoin: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    /// Channels flagged for auto-join on this server.
    pub fn autojoin_channels(&self, server: ServerId) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM channels WHERE server_id=?1 AND autojoin=1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![server.0], |row| row.get(0))?;
        rows.collect()
    }
}

fn row_to_server(row: &rusqlite::Row<'_>) -> SqlResult<ServerRecord> {
    Ok(ServerRecord {
        id: ServerId(row.get(0)?),
        host: row.get(1)?,
        port: row.get(2)?,
        tls: row.get(3)?,
        nick: row.get(4)?,
        username: row.get(5)?,
        realname: row.get(6)?,
        password: row.get(7)?,
        sasl_user: row.get(8)?,
        sasl_pass: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ServerRecord {
        ServerRecord {
            id: ServerId(0),
            host: "irc.example.net".to_string(),
            port: 6697,
            tls: true,
            nick: "dana".to_string(),
            username: "dana".to_string(),
            realname: "Dana".to_string(),
            password: None,
            sasl_user: Some("dana".to_string()),
            sasl_pass: Some("hunter2".to_string()),
        }
    }

    #[test]
    fn server_roundtrip() {
        let store = Store::open_memory().unwrap();
        let id = store.add_server(&record()).unwrap();

        let loaded = store.get_server(id).unwrap().unwrap();
        assert_eq!(loaded.host, "irc.example.net");
        assert!(loaded.tls);
        assert_eq!(loaded.sasl_pass.as_deref(), Some("hunter2"));

        let mut updated = loaded.clone();
        updated.nick = "dana_".to_string();
        store.update_server(&updated).unwrap();
        assert_eq!(store.get_server(id).unwrap().unwrap().nick, "dana_");

        store.delete_server(id).unwrap();
        assert!(store.get_server(id).unwrap().is_none());
    }

    #[test]
    fn autojoin_filters_and_lowercases() {
        let store = Store::open_memory().unwrap();
        let id = store.add_server(&record()).unwrap();

        store
            .save_channel(&ChannelRecord {
                server: id,
                name: "#Ops".to_string(),
                autojoin: true,
            })
            .unwrap();
        store
            .save_channel(&ChannelRecord {
                server: id,
                name: "#lurk".to_string(),
                autojoin: false,
            })
            .unwrap();

        assert_eq!(store.autojoin_channels(id).unwrap(), vec!["#ops"]);
        assert_eq!(store.list_channels(id).unwrap().len(), 2);

        // Upsert flips the flag in place.
        store
            .save_channel(&ChannelRecord {
                server: id,
                name: "#lurk".to_string(),
                autojoin: true,
            })
            .unwrap();
        assert_eq!(store.autojoin_channels(id).unwrap().len(), 2);
    }

    #[test]
    fn deleting_server_drops_its_channels() {
        let store = Store::open_memory().unwrap();
        let id = store.add_server(&record()).unwrap();
        store
            .save_channel(&ChannelRecord {
                server: id,
                name: "#ops".to_string(),
                autojoin: true,
            })
            .unwrap();

        store.delete_server(id).unwrap();
        assert!(store.list_channels(id).unwrap().is_empty());
    }
}
