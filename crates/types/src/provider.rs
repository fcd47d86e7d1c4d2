use async_trait::async_trait;

use crate::{Context, Decision, ProviderError, ProviderId};

/// The model collaborator: produces the next decision for a conversation.
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_id(&self) -> &ProviderId;

    async fn decide(&self, context: &Context) -> Result<Decision, ProviderError>;
}
