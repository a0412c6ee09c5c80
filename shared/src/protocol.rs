/// mDNS service type announced by AI inference hosts
pub const AI_SERVICE_TYPE: &str = "_ai._tcp.local.";

/// TXT record keys used in AI service announcements
pub const TXT_MODEL: &str = "model";
pub const TXT_VERSION: &str = "version";

/// Request header naming the discovered service a chat completion should go to
pub const TARGET_SERVICE_HEADER: &str = "x-ai-service";

/// Chat-completion path, identical on the relay and on upstream inference hosts
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
