//! chainview-modules — domain modules plugged into the ChainView registry.
//!
//! | Module       | Messages | Txs | Blocks | Genesis | Periodic | Reconciler |
//! |--------------|----------|-----|--------|---------|----------|------------|
//! | `profiles`   |          | ✓   |        |         |          | ✓          |
//! | `posts`      | ✓        |     |        | ✓       |          | ✓          |
//! | `feegrant`   | ✓        |     | ✓      |         | ✓        | ✓          |
//! | `reputation` |          |     |        |         | ✓        |            |
//!
//! Each module reaches storage through its own narrow store trait, which is
//! implemented for every [`HeightGatedStore`].

pub mod feegrants;
pub mod posts;
pub mod profiles;
pub mod reputation;

use std::sync::Arc;
use std::time::Duration;

use chainview_core::chain::ChainQuery;
use chainview_core::config::ViewConfig;
use chainview_core::enrichment::EnrichmentBatcher;
use chainview_core::registry::ModuleRegistry;
use chainview_core::store::HeightGatedStore;

pub use feegrants::{FeeGrant, FeeGrantsModule, FeeGrantsStore};
pub use posts::{Post, PostsModule, PostsStore, Reaction};
pub use profiles::{AppLink, Profile, ProfilesModule, ProfilesStore};
pub use reputation::{QueryScoreProvider, ReputationModule, ReputationScore, ReputationStore, ScoreSink};

/// Registry with every built-in module, wired to one store and one chain.
///
/// Registration order is dispatch order.
pub fn build_registry<S>(store: Arc<S>, chain: Arc<dyn ChainQuery>, config: &ViewConfig) -> ModuleRegistry
where
    S: HeightGatedStore + 'static,
{
    let mut registry = ModuleRegistry::new();

    let profiles = Arc::new(ProfilesModule::new(store.clone(), chain.clone()));
    registry.register(profiles.registration());

    let posts = Arc::new(PostsModule::new(store.clone(), chain.clone()));
    registry.register(posts.registration());

    let feegrants = Arc::new(FeeGrantsModule::new(
        store.clone(),
        chain.clone(),
        Duration::from_secs(config.jobs.grant_expiry_secs),
    ));
    registry.register(feegrants.registration());

    let sink = Arc::new(ScoreSink::new(store));
    let batcher = config.enrichment.providers.iter().fold(
        EnrichmentBatcher::<AppLink, f64>::new("scores", sink),
        |batcher, provider| {
            batcher.with_provider(Arc::new(QueryScoreProvider::new(
                provider.name.clone(),
                provider.rate_limit(),
                chain.clone(),
            )))
        },
    );
    let reputation = Arc::new(ReputationModule::new(
        batcher,
        Duration::from_secs(config.jobs.score_refresh_secs),
    ));
    registry.register(reputation.registration());

    registry
}
