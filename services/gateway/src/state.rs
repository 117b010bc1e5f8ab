use crate::config::GatewayConfig;
use crate::control::ControlPublisher;
use crate::delivery::GatewayHandle;
use crate::rate_limit::RateLimiter;
use bus::Broker;
use rolling_cache::RollingCacheManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub gateway: GatewayHandle,
    pub control: ControlPublisher,
    pub cache: Arc<RollingCacheManager>,
    pub broker: Arc<dyn Broker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(
        gateway: GatewayHandle,
        control: ControlPublisher,
        cache: Arc<RollingCacheManager>,
        broker: Arc<dyn Broker>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            gateway,
            control,
            cache,
            broker,
            rate_limiter: Arc::new(RateLimiter::new()),
            config: Arc::new(config),
        }
    }
}
