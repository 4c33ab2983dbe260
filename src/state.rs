use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::llm::{ImageGenerator, PromptEnhancer};
use crate::villa::flow::VillaFlow;

#[derive(Clone)]
pub struct AppState {
    pub config: &'static Config,
    pub flow: Arc<VillaFlow>,
    pub generator: Arc<dyn ImageGenerator>,
    pub enhancer: Option<Arc<PromptEnhancer>>,
}

impl AppState {
    pub fn new(
        config: &'static Config,
        flow: VillaFlow,
        generator: Arc<dyn ImageGenerator>,
        enhancer: Option<PromptEnhancer>,
    ) -> Self {
        AppState {
            config,
            flow: Arc::new(flow),
            generator,
            enhancer: enhancer.map(Arc::new),
        }
    }

    /// Periodically drops questionnaires nobody touched for the idle timeout.
    pub fn spawn_session_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let flow = Arc::clone(&self.flow);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = flow.conversation().sweep_idle();
                if removed > 0 {
                    info!("Expired {} idle villa sessions", removed);
                }
            }
        })
    }
}
