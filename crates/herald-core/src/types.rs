use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one conversation slice: a user inside a chat, optionally
/// scoped to a forum topic. One thread per triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub chat_id: i64,
    pub user_id: i64,
    pub topic_id: Option<i64>,
}

impl ThreadKey {
    pub fn new(chat_id: i64, user_id: i64, topic_id: Option<i64>) -> Self {
        Self {
            chat_id,
            user_id,
            topic_id,
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.chat_id,
            self.user_id,
            self.topic_id.unwrap_or(0)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    #[default]
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Supergroup => "supergroup",
            ChatKind::Channel => "channel",
        }
    }
}

impl std::str::FromStr for ChatKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "private" => Ok(ChatKind::Private),
            "group" => Ok(ChatKind::Group),
            "supergroup" => Ok(ChatKind::Supergroup),
            "channel" => Ok(ChatKind::Channel),
            other => Err(format!("unknown chat kind: {other}")),
        }
    }
}

/// File classification carried on every `UserFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Pdf,
    Document,
    Audio,
    Voice,
    Video,
    Generated,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Pdf => "pdf",
            FileKind::Document => "document",
            FileKind::Audio => "audio",
            FileKind::Voice => "voice",
            FileKind::Video => "video",
            FileKind::Generated => "generated",
        }
    }

    /// Classify from a MIME type (ingress path).
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            FileKind::Image
        } else if mime == "application/pdf" {
            FileKind::Pdf
        } else if mime.starts_with("audio/ogg") {
            FileKind::Voice
        } else if mime.starts_with("audio/") {
            FileKind::Audio
        } else if mime.starts_with("video/") {
            FileKind::Video
        } else {
            FileKind::Document
        }
    }
}

impl std::str::FromStr for FileKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "image" => Ok(FileKind::Image),
            "pdf" => Ok(FileKind::Pdf),
            "document" => Ok(FileKind::Document),
            "audio" => Ok(FileKind::Audio),
            "voice" => Ok(FileKind::Voice),
            "video" => Ok(FileKind::Video),
            "generated" => Ok(FileKind::Generated),
            other => Err(format!("unknown file kind: {other}")),
        }
    }
}

/// Who put a file into the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOrigin {
    User,
    Assistant,
}

impl FileOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOrigin::User => "user",
            FileOrigin::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for FileOrigin {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(FileOrigin::User),
            "assistant" => Ok(FileOrigin::Assistant),
            other => Err(format!("unknown file origin: {other}")),
        }
    }
}

/// Balance audit row kind. Only `billing::apply` writes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Deposit,
    Charge,
    Refund,
    AdminAdjust,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Deposit => "deposit",
            OpKind::Charge => "charge",
            OpKind::Refund => "refund",
            OpKind::AdminAdjust => "admin_adjust",
        }
    }
}

impl std::str::FromStr for OpKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(OpKind::Deposit),
            "charge" => Ok(OpKind::Charge),
            "refund" => Ok(OpKind::Refund),
            "admin_adjust" => Ok(OpKind::AdminAdjust),
            other => Err(format!("unknown operation kind: {other}")),
        }
    }
}

/// Token counts for one LLM turn, cumulative as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub cache_read: u32,
    pub cache_write: u32,
    pub thinking: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.thinking += other.thinking;
    }

    pub fn is_zero(&self) -> bool {
        self.input == 0
            && self.output == 0
            && self.cache_read == 0
            && self.cache_write == 0
            && self.thinking == 0
    }
}

/// A user known to the system, keyed by their Telegram id.
///
/// `balance` is never mutated directly — every change goes through a
/// `BalanceOperation` in the same store transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub display_name: String,
    pub preferred_model: Option<String>,
    pub custom_personality: Option<String>,
    pub balance: Decimal,
    pub is_premium: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub is_forum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub chat_id: i64,
    pub user_id: i64,
    pub topic_id: Option<i64>,
    /// Per-thread model override; falls back to the user preference,
    /// then the configured default.
    pub model_key: Option<String>,
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn key(&self) -> ThreadKey {
        ThreadKey::new(self.chat_id, self.user_id, self.topic_id)
    }
}

/// Typed file descriptor attached to a stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: String,
    pub provider_file_id: String,
    pub kind: FileKind,
    pub filename: String,
    pub mime: String,
    pub size: i64,
}

/// One message in a thread.
///
/// Frontend-originated messages carry the Telegram message id in
/// `external_id` (unique per chat); internal agent-loop turns (tool_use /
/// tool_result pairs) have no frontend identity and leave it `None`.
/// `content_blocks` holds raw provider content blocks (tool_use,
/// tool_result, thinking with signatures) needed to rebuild later requests
/// verbatim; plain text turns leave it `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: i64,
    pub external_id: Option<i64>,
    pub thread_id: String,
    pub role: Role,
    pub text: String,
    pub caption: Option<String>,
    pub reply_to: Option<i64>,
    pub media_group_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub content_blocks: Option<serde_json::Value>,
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// Fresh internal message (no frontend identity).
    pub fn internal(thread: &Thread, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            chat_id: thread.chat_id,
            external_id: None,
            thread_id: thread.id.clone(),
            role,
            text: text.into(),
            caption: None,
            reply_to: None,
            media_group_id: None,
            attachments: Vec::new(),
            content_blocks: None,
            usage: TokenUsage::default(),
            created_at: Utc::now(),
            edited_at: None,
        }
    }
}

/// A file known to the system: uploaded by a user or produced by the
/// assistant, mirrored to the provider's file service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFile {
    pub id: String,
    pub thread_id: String,
    /// Frontend file id (Telegram `file_id`), when the file came from a user.
    pub source_ref: Option<String>,
    pub provider_file_id: String,
    pub filename: String,
    pub kind: FileKind,
    pub mime: String,
    pub size: i64,
    pub uploaded_at: DateTime<Utc>,
    /// `uploaded_at + TTL`; the cleaner deletes provider file and row past this.
    pub expires_at: DateTime<Utc>,
    pub origin: FileOrigin,
    /// Free text that accompanied the upload ("check my homework") or the
    /// tool-supplied context for generated files.
    pub upload_context: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl UserFile {
    pub fn attachment(&self) -> Attachment {
        Attachment {
            file_id: self.id.clone(),
            provider_file_id: self.provider_file_id.clone(),
            kind: self.kind,
            filename: self.filename.clone(),
            mime: self.mime.clone(),
            size: self.size,
        }
    }
}

/// Immutable balance audit row. `balance_before + amount == balance_after`
/// on every row, enforced by the single writer in `herald-store`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceOperation {
    pub id: String,
    pub user_id: i64,
    pub kind: OpKind,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    pub provider_charge_id: Option<String>,
    pub message_ref: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Normalized ingress event: all frontend I/O (download, upload,
/// transcription) already completed. What the batcher queues and the
/// orchestrator consumes.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub key: ThreadKey,
    pub external_id: i64,
    pub text: String,
    pub caption: Option<String>,
    pub reply_to: Option<i64>,
    pub media_group_id: Option<String>,
    pub files: Vec<UserFile>,
    pub upload_context: Option<String>,
    /// Set when a voice/video-note transcription failed; the event is still
    /// forwarded with an empty transcript.
    pub transcription_failed: bool,
    pub date: DateTime<Utc>,
}

/// A tool-produced file parked in the cache awaiting `deliver_file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecArtifact {
    pub temp_id: String,
    pub thread_id: String,
    pub filename: String,
    pub mime: String,
    /// Context string from the producing tool ("histogram of X").
    pub context: Option<String>,
    #[serde(with = "b64_bytes")]
    pub bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Base64 (de)serialization for artifact payloads — JSON-safe and compact
/// enough for cache-resident blobs.
mod b64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        use base64::Engine as _;
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine as _;
        let s = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_key_display_defaults_topic_to_zero() {
        let key = ThreadKey::new(10, 20, None);
        assert_eq!(key.to_string(), "10:20:0");
        let key = ThreadKey::new(10, 20, Some(7));
        assert_eq!(key.to_string(), "10:20:7");
    }

    #[test]
    fn file_kind_from_mime() {
        assert_eq!(FileKind::from_mime("image/png"), FileKind::Image);
        assert_eq!(FileKind::from_mime("application/pdf"), FileKind::Pdf);
        assert_eq!(FileKind::from_mime("audio/ogg"), FileKind::Voice);
        assert_eq!(FileKind::from_mime("audio/mpeg"), FileKind::Audio);
        assert_eq!(FileKind::from_mime("video/mp4"), FileKind::Video);
        assert_eq!(FileKind::from_mime("text/csv"), FileKind::Document);
    }

    #[test]
    fn token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            input: 100,
            output: 50,
            cache_read: 10,
            cache_write: 5,
            thinking: 20,
        });
        total.add(&TokenUsage {
            input: 1,
            output: 2,
            cache_read: 3,
            cache_write: 4,
            thinking: 5,
        });
        assert_eq!(total.input, 101);
        assert_eq!(total.output, 52);
        assert_eq!(total.cache_read, 13);
        assert_eq!(total.cache_write, 9);
        assert_eq!(total.thinking, 25);
    }

    #[test]
    fn exec_artifact_bytes_roundtrip() {
        let art = ExecArtifact {
            temp_id: "t1".into(),
            thread_id: "th1".into(),
            filename: "plot.png".into(),
            mime: "image/png".into(),
            context: Some("histogram of X".into()),
            bytes: vec![0, 1, 2, 255],
            preview: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&art).unwrap();
        let back: ExecArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes, vec![0, 1, 2, 255]);
    }
}
