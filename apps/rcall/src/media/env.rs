use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::{API, APIBuilder};
use webrtc::interceptor::registry::Registry;

use super::EngineError;

static SHARED: Lazy<Mutex<Weak<MediaEnvironment>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Process-wide WebRTC API (codecs + interceptors), shared by every peer
/// connection and torn down when the last handle is dropped.
pub struct MediaEnvironment {
    api: API,
}

impl MediaEnvironment {
    /// Returns the live environment, building it on first use.
    pub fn acquire() -> Result<Arc<Self>, EngineError> {
        let mut shared = SHARED.lock();
        if let Some(env) = shared.upgrade() {
            return Ok(env);
        }
        let env = Arc::new(Self { api: build_api()? });
        *shared = Arc::downgrade(&env);
        tracing::debug!(target = "rcall::media", "media environment initialised");
        Ok(env)
    }

    pub fn api(&self) -> &API {
        &self.api
    }
}

impl Drop for MediaEnvironment {
    fn drop(&mut self) {
        tracing::debug!(target = "rcall::media", "media environment released");
    }
}

fn build_api() -> Result<API, EngineError> {
    let mut codecs = CodecRegistry::default();
    codecs.register_default_codecs().map_err(EngineError::new)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut codecs).map_err(EngineError::new)?;

    Ok(APIBuilder::new()
        .with_media_engine(codecs)
        .with_interceptor_registry(registry)
        .build())
}
