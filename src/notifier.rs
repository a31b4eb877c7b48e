// =============================================================================
// Notifier — best-effort outward messaging (Telegram)
// =============================================================================
//
// SAFETY POLICY: nothing on the trade lifecycle path may depend on a
// notification reaching its destination.  Every failure here is logged and
// swallowed; `send` never returns an error to its caller.
// =============================================================================

use std::time::Duration;

use tracing::{debug, warn};

/// Marker prepended to messages that demand manual attention.
const CRITICAL_PREFIX: &str = "🚨 CRITICAL";

/// Where messages go.
enum Transport {
    /// Telegram bot API via an HTTP form post.
    Telegram {
        bot_token: String,
        chat_id: String,
        client: reqwest::Client,
    },
    /// No credentials configured — messages are logged only.
    Disabled,
    /// In-memory sink for tests.
    #[cfg(test)]
    Memory(parking_lot::Mutex<Vec<String>>),
}

/// Best-effort outward messenger.
pub struct Notifier {
    transport: Transport,
}

impl Notifier {
    /// Build a notifier from the `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`
    /// environment variables.  Missing credentials degrade to log-only mode.
    pub fn from_env() -> Self {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();

        if bot_token.is_empty() || chat_id.is_empty() {
            warn!("telegram credentials not configured — notifications are log-only");
            return Self {
                transport: Transport::Disabled,
            };
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            transport: Transport::Telegram {
                bot_token,
                chat_id,
                client,
            },
        }
    }

    /// In-memory notifier for tests; captured messages are inspected via
    /// [`Notifier::sent_messages`].
    #[cfg(test)]
    pub fn memory() -> Self {
        Self {
            transport: Transport::Memory(parking_lot::Mutex::new(Vec::new())),
        }
    }

    #[cfg(test)]
    pub fn sent_messages(&self) -> Vec<String> {
        match &self.transport {
            Transport::Memory(store) => store.lock().clone(),
            _ => Vec::new(),
        }
    }

    /// Send an informational message.  Failures are logged and swallowed.
    pub async fn send(&self, text: &str) {
        match &self.transport {
            Transport::Telegram {
                bot_token,
                chat_id,
                client,
            } => {
                let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
                let params = [("chat_id", chat_id.as_str()), ("text", text)];

                match client.post(&url).form(&params).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(len = text.len(), "notification sent");
                    }
                    Ok(resp) => {
                        warn!(status = %resp.status(), "notification rejected by telegram");
                    }
                    Err(e) => {
                        warn!(error = %e, "notification send failed");
                    }
                }
            }
            Transport::Disabled => {
                debug!(message = text, "notification (log-only)");
            }
            #[cfg(test)]
            Transport::Memory(store) => {
                store.lock().push(text.to_string());
            }
        }
    }

    /// Send a message flagged as requiring manual attention.
    pub async fn send_critical(&self, text: &str) {
        warn!(message = text, "critical notification");
        self.send(&format!("{CRITICAL_PREFIX} {text}")).await;
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.transport {
            Transport::Telegram { .. } => "telegram",
            Transport::Disabled => "disabled",
            #[cfg(test)]
            Transport::Memory(_) => "memory",
        };
        f.debug_struct("Notifier").field("transport", &kind).finish()
    }
}
