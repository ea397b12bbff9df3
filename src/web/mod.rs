pub mod page;
pub mod server;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Settings;
use crate::error::ApiResult;
use crate::inference::Generate;
use crate::manager::SessionManager;
use crate::ocr::OcrAdapter;
use crate::render::UploadGuard;
use crate::store::Store;

/// What one browser context remembers between interactions.
#[derive(Debug, Default)]
pub struct UiContext {
    pub current: Option<String>,
    pub ocr_mode: bool,
    pub uploads: UploadGuard,
}

impl UiContext {
    pub fn remember(&mut self, manager: &SessionManager) {
        self.current = Some(manager.current_id().to_string());
    }
}

pub struct AppState {
    pub store: Store,
    pub model: String,
    pub generator: Arc<dyn Generate>,
    pub ocr: OcrAdapter,
    pub pages: page::PageRenderer,
    /// Held for the whole of each interaction, including a streaming turn.
    pub ui: Arc<Mutex<UiContext>>,
}

impl AppState {
    pub fn new(
        settings: &Settings,
        generator: Arc<dyn Generate>,
        ocr: OcrAdapter,
    ) -> anyhow::Result<Self> {
        let store = Store::new(&settings.data_dir);
        debug!("Sessions file: {}", store.sessions_path().display());

        Ok(Self {
            store,
            model: settings.model.clone(),
            generator,
            ocr,
            pages: page::PageRenderer::new()?,
            ui: Arc::new(Mutex::new(UiContext::default())),
        })
    }

    /// Load a manager for this interaction and record its current session.
    pub async fn open_manager(&self, ui: &mut UiContext) -> ApiResult<SessionManager> {
        let manager = SessionManager::open(self.store.clone(), ui.current.clone()).await?;
        ui.remember(&manager);
        Ok(manager)
    }
}
