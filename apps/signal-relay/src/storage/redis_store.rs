use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::{record_key, NegotiationRecord, NegotiationStore};
use crate::error::StoreError;
use crate::signaling::{SessionDescription, TrickledCandidate};

// Both scripts rewrite the whole `session:<key>` document server side, so
// concurrent appends and description updates on one key cannot lose writes.
// cjson encodes an empty table as `{}`; an empty candidate list is dropped
// before encoding and restored by the record's serde default.

const APPEND_CANDIDATE: &str = r#"
local raw = redis.call('GET', KEYS[1])
local doc
if raw then doc = cjson.decode(raw) else doc = { id = ARGV[3] } end
local entry = cjson.decode(ARGV[1])
local list = doc.ice_candidates
if type(list) ~= 'table' then list = {} end
for _, seen in ipairs(list) do
  if seen.candidate == entry.candidate and seen.sdpMid == entry.sdpMid
    and seen.sdpMLineIndex == entry.sdpMLineIndex
    and seen.usernameFragment == entry.usernameFragment
    and seen.target == entry.target then
    return 0
  end
end
table.insert(list, entry)
doc.ice_candidates = list
doc.updated_at = ARGV[2]
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('SET', KEYS[1], cjson.encode(doc), 'EX', ttl)
else
  redis.call('SET', KEYS[1], cjson.encode(doc))
end
return 1
"#;

const SET_DESCRIPTION: &str = r#"
local raw = redis.call('GET', KEYS[1])
local doc
if raw then doc = cjson.decode(raw) else doc = { id = ARGV[4] } end
doc[ARGV[1]] = cjson.decode(ARGV[2])
doc.updated_at = ARGV[3]
if type(doc.ice_candidates) == 'table' and next(doc.ice_candidates) == nil then
  doc.ice_candidates = nil
end
local ttl = tonumber(ARGV[5])
if ttl > 0 then
  redis.call('SET', KEYS[1], cjson.encode(doc), 'EX', ttl)
else
  redis.call('SET', KEYS[1], cjson.encode(doc))
end
return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
    append: Script,
    describe: Script,
}

impl RedisStore {
    /// Connect and verify the server answers. `ttl_seconds == 0` keeps
    /// records without expiry.
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let mut redis = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<String>(&mut redis).await?;

        Ok(Self {
            redis,
            ttl_seconds,
            append: Script::new(APPEND_CANDIDATE),
            describe: Script::new(SET_DESCRIPTION),
        })
    }
}

#[async_trait]
impl NegotiationStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn store(&self, record: &NegotiationRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let key = record_key(&record.id);
        let value = serde_json::to_string(record)?;
        if self.ttl_seconds > 0 {
            conn.set_ex::<_, _, ()>(&key, value, self.ttl_seconds)
                .await?;
        } else {
            conn.set::<_, _, ()>(&key, value).await?;
        }
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<NegotiationRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(record_key(key)).await?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn append_candidate(
        &self,
        key: &str,
        entry: &TrickledCandidate,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let appended: i64 = self
            .append
            .key(record_key(key))
            .arg(serde_json::to_string(entry)?)
            .arg(Utc::now().to_rfc3339())
            .arg(key)
            .arg(self.ttl_seconds)
            .invoke_async(&mut conn)
            .await?;
        if appended == 0 {
            tracing::trace!(session = %key, "candidate already recorded");
        }
        Ok(())
    }

    async fn set_description(
        &self,
        key: &str,
        description: &SessionDescription,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let field = match description.sdp_type {
            crate::signaling::SdpType::Offer => "offer",
            _ => "answer",
        };
        let _: i64 = self
            .describe
            .key(record_key(key))
            .arg(field)
            .arg(serde_json::to_string(description)?)
            .arg(Utc::now().to_rfc3339())
            .arg(key)
            .arg(self.ttl_seconds)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
