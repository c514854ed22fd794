use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tasklane_types::{Label, Task, TaskImage};
use uuid::Uuid;

use crate::error::ClientError;
use crate::mutation_client::MutationClient;

/// Tracks live preview references handed out to views.
#[derive(Clone, Default)]
pub struct PreviewRegistry {
    live: Arc<Mutex<HashMap<String, String>>>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, image: &TaskImage) -> PreviewHandle {
        let url = format!("preview:{}", Uuid::new_v4());
        self.live.lock().insert(url.clone(), image.url.clone());
        PreviewHandle {
            url,
            registry: self.clone(),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_live(&self, url: &str) -> bool {
        self.live.lock().contains_key(url)
    }

    fn revoke(&self, url: &str) {
        if self.live.lock().remove(url).is_some() {
            tracing::trace!(url, "revoked preview");
        }
    }
}

/// A preview reference, revoked when dropped.
pub struct PreviewHandle {
    url: String,
    registry: PreviewRegistry,
}

impl PreviewHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.registry.revoke(&self.url);
    }
}

pub struct SelectedImage {
    pub image: TaskImage,
    preview: PreviewHandle,
}

impl SelectedImage {
    pub fn preview_url(&self) -> &str {
        self.preview.url()
    }
}

/// Form state for composing a new task.
pub struct TaskDraft {
    label: String,
    image: Option<SelectedImage>,
    previews: PreviewRegistry,
}

impl TaskDraft {
    pub fn new(previews: PreviewRegistry) -> Self {
        Self {
            label: String::new(),
            image: None,
            previews,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Same rule `Label::parse` applies on submit.
    pub fn can_submit(&self) -> bool {
        Label::is_valid(&self.label)
    }

    /// Selecting a new image (or clearing it) revokes the previous preview.
    pub fn select_image(&mut self, image: Option<TaskImage>) {
        self.image = image.map(|image| SelectedImage {
            preview: self.previews.create(&image),
            image,
        });
    }

    pub fn preview_url(&self) -> Option<&str> {
        self.image.as_ref().map(SelectedImage::preview_url)
    }

    pub fn reset(&mut self) {
        self.label.clear();
        self.image = None;
    }

    /// Submits the draft. A rejected label keeps the draft as typed; once the
    /// request was sent the draft is cleared whether or not it succeeded.
    pub async fn submit(&mut self, client: &MutationClient) -> Result<Task, ClientError> {
        let label = Label::parse(self.label.clone())?;
        let image = self.image.as_ref().map(|selected| selected.image.clone());
        let result = client.create(label.into_inner(), image).await;
        self.reset();
        result
    }
}
