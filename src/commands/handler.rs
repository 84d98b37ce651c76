//! Command Dispatch
//!
//! A request arrives as a list of tokens. The first token names the command
//! (case-insensitive), the rest are its arguments. Each `cmd_*` method checks
//! its argument count before touching the store, so a malformed request
//! never causes a partial mutation.
//!
//! ## Supported Commands
//!
//! ### Keyspace
//! - `PING [message]`, `ECHO message`
//! - `FLUSHALL` / `FLUSHDB`, `DBSIZE`
//! - `KEYS [pattern]`, `TYPE key`, `EXISTS key [key ...]`
//! - `DEL key [key ...]` / `UNLINK key [key ...]`
//! - `EXPIRE key seconds`, `TTL key`, `PERSIST key`
//! - `RENAME key newkey`
//!
//! ### Strings
//! - `SET key value`, `GET key`
//!
//! ### Lists
//! - `LPUSH` / `RPUSH key value [value ...]`, `LPOP` / `RPOP key`
//! - `LLEN key`, `LINDEX key index`, `LRANGE key start stop`
//! - `LSET key index value`, `LREM key count value`
//!
//! ### Hashes
//! - `HSET key field value`, `HMSET key field value [field value ...]`
//! - `HGET`, `HEXISTS`, `HDEL key field`
//! - `HGETALL`, `HKEYS`, `HVALS`, `HLEN key`

use crate::protocol::RespValue;
use crate::storage::{StorageEngine, StorageError, StorageResult};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";

impl From<StorageError> for RespValue {
    fn from(err: StorageError) -> Self {
        RespValue::error(err.to_string())
    }
}

fn wrong_arity(name: &str) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name
    ))
}

/// Converts a store result into a reply, mapping failures to error replies.
fn reply<T>(result: StorageResult<T>, ok: impl FnOnce(T) -> RespValue) -> RespValue {
    match result {
        Ok(value) => ok(value),
        Err(e) => e.into(),
    }
}

/// Parses a signed decimal argument.
fn parse_integer(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

/// Executes commands against a shared store.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// Executes a command and returns the encoded reply.
    pub fn handle(&self, tokens: &[Bytes]) -> Vec<u8> {
        self.execute(tokens).serialize()
    }

    /// Executes a command and returns the reply.
    ///
    /// # Example
    ///
    /// ```
    /// use snapkv::commands::CommandHandler;
    /// use snapkv::protocol::RespValue;
    /// use snapkv::storage::StorageEngine;
    /// use bytes::Bytes;
    /// use std::sync::Arc;
    ///
    /// let handler = CommandHandler::new(Arc::new(StorageEngine::new()));
    /// let set = [Bytes::from("set"), Bytes::from("foo"), Bytes::from("bar")];
    /// assert_eq!(handler.execute(&set), RespValue::ok());
    /// ```
    pub fn execute(&self, tokens: &[Bytes]) -> RespValue {
        let Some((name, args)) = tokens.split_first() else {
            return RespValue::error("ERR empty command");
        };

        let cmd = String::from_utf8_lossy(name).to_ascii_uppercase();
        let reply = self.dispatch(&cmd, args).unwrap_or_else(|| {
            RespValue::error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(name)
            ))
        });
        if reply.is_error() {
            debug!(command = %cmd, reply = ?reply, "Command failed");
        }
        reply
    }

    /// Routes a command to its handler; `None` for unknown names.
    fn dispatch(&self, cmd: &str, args: &[Bytes]) -> Option<RespValue> {
        let reply = match cmd {
            // Keyspace
            "PING" => self.cmd_ping(args),
            "ECHO" => self.cmd_echo(args),
            "FLUSHALL" | "FLUSHDB" => self.cmd_flushall(),
            "DBSIZE" => RespValue::integer(self.storage.len() as i64),
            "KEYS" => self.cmd_keys(args),
            "TYPE" => self.cmd_type(args),
            "DEL" | "UNLINK" => self.cmd_del(cmd, args),
            "EXISTS" => self.cmd_exists(args),
            "EXPIRE" => self.cmd_expire(args),
            "TTL" => self.cmd_ttl(args),
            "PERSIST" => self.cmd_persist(args),
            "RENAME" => self.cmd_rename(args),

            // Strings
            "SET" => self.cmd_set(args),
            "GET" => self.cmd_get(args),

            // Lists
            "LPUSH" => self.cmd_push(cmd, args, StorageEngine::lpush),
            "RPUSH" => self.cmd_push(cmd, args, StorageEngine::rpush),
            "LPOP" => self.cmd_pop(cmd, args, StorageEngine::lpop),
            "RPOP" => self.cmd_pop(cmd, args, StorageEngine::rpop),
            "LLEN" => self.cmd_llen(args),
            "LINDEX" => self.cmd_lindex(args),
            "LRANGE" => self.cmd_lrange(args),
            "LSET" => self.cmd_lset(args),
            "LREM" => self.cmd_lrem(args),

            // Hashes
            "HSET" => self.cmd_hset(args),
            "HMSET" => self.cmd_hmset(args),
            "HGET" => self.cmd_hget(args),
            "HEXISTS" => self.cmd_hexists(args),
            "HDEL" => self.cmd_hdel(args),
            "HGETALL" => self.cmd_hgetall(args),
            "HKEYS" => self.cmd_hkeys(args),
            "HVALS" => self.cmd_hvals(args),
            "HLEN" => self.cmd_hlen(args),

            _ => return None,
        };
        Some(reply)
    }

    // ========================================================================
    // Keyspace Commands
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, args: &[Bytes]) -> RespValue {
        match args.first() {
            Some(message) => RespValue::bulk_string(message.clone()),
            None => RespValue::pong(),
        }
    }

    /// ECHO message
    fn cmd_echo(&self, args: &[Bytes]) -> RespValue {
        match args.first() {
            Some(message) => RespValue::bulk_string(message.clone()),
            None => wrong_arity("ECHO"),
        }
    }

    fn cmd_flushall(&self) -> RespValue {
        self.storage.flush();
        RespValue::ok()
    }

    /// KEYS [pattern]
    fn cmd_keys(&self, args: &[Bytes]) -> RespValue {
        let pattern = args.first().map_or(&b"*"[..], |p| &p[..]);
        RespValue::bulk_array(self.storage.keys(pattern))
    }

    /// TYPE key
    fn cmd_type(&self, args: &[Bytes]) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity("TYPE");
        };
        let name = self.storage.key_type(key).map_or("none", |t| t.as_str());
        RespValue::simple_string(name)
    }

    /// DEL key [key ...]
    fn cmd_del(&self, cmd: &str, args: &[Bytes]) -> RespValue {
        if args.is_empty() {
            return wrong_arity(cmd);
        }
        RespValue::integer(self.storage.delete_many(args) as i64)
    }

    /// EXISTS key [key ...]
    fn cmd_exists(&self, args: &[Bytes]) -> RespValue {
        if args.is_empty() {
            return wrong_arity("EXISTS");
        }
        RespValue::integer(self.storage.exists_many(args) as i64)
    }

    /// EXPIRE key seconds
    ///
    /// A zero or negative number of seconds makes the key due immediately;
    /// more than `MAX_TTL` is rejected.
    fn cmd_expire(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("EXPIRE");
        }

        let Some(seconds) = parse_integer(&args[1]) else {
            return RespValue::error("ERR invalid expire time");
        };
        let ttl = Duration::from_secs(seconds.max(0) as u64);

        match self.storage.expire(&args[0], ttl) {
            Ok(true) => RespValue::ok(),
            Ok(false) => StorageError::NoSuchKey.into(),
            Err(e) => e.into(),
        }
    }

    /// TTL key
    fn cmd_ttl(&self, args: &[Bytes]) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity("TTL");
        };
        RespValue::integer(self.storage.ttl(key).unwrap_or(-2))
    }

    /// PERSIST key
    fn cmd_persist(&self, args: &[Bytes]) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity("PERSIST");
        };
        RespValue::integer(self.storage.persist(key) as i64)
    }

    /// RENAME key newkey
    fn cmd_rename(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("RENAME");
        }
        reply(self.storage.rename(&args[0], args[1].clone()), |()| {
            RespValue::ok()
        })
    }

    // ========================================================================
    // String Commands
    // ========================================================================

    /// SET key value
    fn cmd_set(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("SET");
        }
        self.storage.set(args[0].clone(), args[1].clone());
        RespValue::ok()
    }

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity("GET");
        };
        RespValue::optional_bulk(self.storage.get(key))
    }

    // ========================================================================
    // List Commands
    // ========================================================================

    /// LPUSH / RPUSH key value [value ...]
    fn cmd_push(
        &self,
        cmd: &str,
        args: &[Bytes],
        push: fn(&StorageEngine, Bytes, Vec<Bytes>) -> StorageResult<usize>,
    ) -> RespValue {
        if args.len() < 2 {
            return wrong_arity(cmd);
        }
        reply(
            push(&self.storage, args[0].clone(), args[1..].to_vec()),
            |len| RespValue::integer(len as i64),
        )
    }

    /// LPOP / RPOP key
    fn cmd_pop(
        &self,
        cmd: &str,
        args: &[Bytes],
        pop: fn(&StorageEngine, &[u8]) -> StorageResult<Option<Bytes>>,
    ) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity(cmd);
        };
        reply(pop(&self.storage, key), RespValue::optional_bulk)
    }

    /// LLEN key
    fn cmd_llen(&self, args: &[Bytes]) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity("LLEN");
        };
        reply(self.storage.llen(key), |len| RespValue::integer(len as i64))
    }

    /// LINDEX key index
    fn cmd_lindex(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("LINDEX");
        }
        let Some(index) = parse_integer(&args[1]) else {
            return RespValue::error(NOT_AN_INTEGER);
        };
        reply(self.storage.lindex(&args[0], index), RespValue::optional_bulk)
    }

    /// LRANGE key start stop
    fn cmd_lrange(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 3 {
            return wrong_arity("LRANGE");
        }
        let (Some(start), Some(stop)) = (parse_integer(&args[1]), parse_integer(&args[2])) else {
            return RespValue::error(NOT_AN_INTEGER);
        };
        reply(
            self.storage.lrange(&args[0], start, stop),
            RespValue::bulk_array,
        )
    }

    /// LSET key index value
    fn cmd_lset(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 3 {
            return wrong_arity("LSET");
        }
        let Some(index) = parse_integer(&args[1]) else {
            return RespValue::error(NOT_AN_INTEGER);
        };
        reply(
            self.storage.lset(&args[0], index, args[2].clone()),
            |()| RespValue::ok(),
        )
    }

    /// LREM key count value
    fn cmd_lrem(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 3 {
            return wrong_arity("LREM");
        }
        let Some(count) = parse_integer(&args[1]) else {
            return RespValue::error(NOT_AN_INTEGER);
        };
        reply(self.storage.lrem(&args[0], count, &args[2]), |removed| {
            RespValue::integer(removed as i64)
        })
    }

    // ========================================================================
    // Hash Commands
    // ========================================================================

    /// HSET key field value
    fn cmd_hset(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 3 {
            return wrong_arity("HSET");
        }
        reply(
            self.storage
                .hset(args[0].clone(), args[1].clone(), args[2].clone()),
            |_| RespValue::integer(1),
        )
    }

    /// HMSET key field value [field value ...]
    fn cmd_hmset(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 3 || (args.len() - 1) % 2 != 0 {
            return wrong_arity("HMSET");
        }
        let pairs = args[1..]
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        reply(self.storage.hmset(args[0].clone(), pairs), |()| {
            RespValue::ok()
        })
    }

    /// HGET key field
    fn cmd_hget(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("HGET");
        }
        reply(
            self.storage.hget(&args[0], &args[1]),
            RespValue::optional_bulk,
        )
    }

    /// HEXISTS key field
    fn cmd_hexists(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("HEXISTS");
        }
        reply(self.storage.hexists(&args[0], &args[1]), |found| {
            RespValue::integer(found as i64)
        })
    }

    /// HDEL key field
    fn cmd_hdel(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("HDEL");
        }
        reply(self.storage.hdel(&args[0], &args[1]), |removed| {
            RespValue::integer(removed as i64)
        })
    }

    /// HGETALL key
    fn cmd_hgetall(&self, args: &[Bytes]) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity("HGETALL");
        };
        reply(self.storage.hgetall(key), |pairs| {
            RespValue::bulk_array(pairs.into_iter().flat_map(|(f, v)| [f, v]))
        })
    }

    /// HKEYS key
    fn cmd_hkeys(&self, args: &[Bytes]) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity("HKEYS");
        };
        reply(self.storage.hkeys(key), RespValue::bulk_array)
    }

    /// HVALS key
    fn cmd_hvals(&self, args: &[Bytes]) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity("HVALS");
        };
        reply(self.storage.hvals(key), RespValue::bulk_array)
    }

    /// HLEN key
    fn cmd_hlen(&self, args: &[Bytes]) -> RespValue {
        let Some(key) = args.first() else {
            return wrong_arity("HLEN");
        };
        reply(self.storage.hlen(key), |len| RespValue::integer(len as i64))
    }
}
