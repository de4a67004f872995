use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use eventwire_frame::DEFAULT_CHANNEL;

/// Message sent back when a client asks for a channel the server does not serve.
pub const INVALID_NAMESPACE: &str = "invalid namespace";

/// Decides whether a client may join a channel.
///
/// `auth` is the optional token carried by the CONNECT frame. Returning
/// `Err(message)` rejects the join; the message is sent to the client in an
/// ERROR frame.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, channel: &str, auth: Option<&str>) -> Result<(), String>;
}

impl<F> Authorizer for F
where
    F: Fn(&str, Option<&str>) -> Result<(), String> + Send + Sync,
{
    fn authorize(&self, channel: &str, auth: Option<&str>) -> Result<(), String> {
        self(channel, auth)
    }
}

/// Accepts every join.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _channel: &str, _auth: Option<&str>) -> Result<(), String> {
        Ok(())
    }
}

/// Server-side admission: namespace allow-list plus authorizer.
#[derive(Clone)]
pub(crate) struct ChannelGate {
    allowed: Option<BTreeSet<String>>,
    authorizer: Arc<dyn Authorizer>,
}

impl ChannelGate {
    pub(crate) fn new(allowed: Option<BTreeSet<String>>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            allowed,
            authorizer,
        }
    }

    /// The default channel is always served; the authorizer still runs for it.
    pub(crate) fn admit(&self, channel: &str, auth: Option<&str>) -> Result<(), String> {
        if channel != DEFAULT_CHANNEL {
            if let Some(allowed) = &self.allowed {
                if !allowed.contains(channel) {
                    return Err(INVALID_NAMESPACE.to_string());
                }
            }
        }
        self.authorizer.authorize(channel, auth)
    }
}

impl Default for ChannelGate {
    fn default() -> Self {
        Self::new(None, Arc::new(AllowAll))
    }
}

impl fmt::Debug for ChannelGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGate")
            .field("allowed", &self.allowed)
            .finish_non_exhaustive()
    }
}
