//! Rendering of digest payloads into mailable documents.

pub mod html;

use std::{ops::Deref, sync::Arc};

use crate::base::types::{DigestPayload, Document, Res};

// Traits.

/// Generic renderer trait that implementations must provide.
///
/// Rendering is expected to fail only on a malformed payload, never because the
/// message sequence is empty.
pub trait GenericRenderer: Send + Sync + 'static {
    /// Render a payload into a document.
    fn render(&self, payload: &DigestPayload) -> Res<Document>;
}

// Structs.

/// Renderer handle for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct Renderer {
    inner: Arc<dyn GenericRenderer>,
}

impl Deref for Renderer {
    type Target = dyn GenericRenderer;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl Renderer {
    pub fn new(inner: Arc<dyn GenericRenderer>) -> Self {
        Self { inner }
    }
}
