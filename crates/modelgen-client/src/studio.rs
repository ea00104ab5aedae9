use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::chat::{ChatLine, ChatSession};
use crate::error::{ClientError, Result};
use crate::params::ParameterEditor;
use crate::payment::{PaymentReceipt, PaymentWidget, purchase};
use crate::state::{ApplyOutcome, ModelState, ModelStateTracker, RequestTicket};
use crate::upload::ImageFile;
use crate::view::{Tab, View, ViewMode, ViewPresenter};
use crate::viewer::{FRAME_INTERVAL, MeshViewer, RedrawLoop};
use crate::wire::{GenerateRequest, ModelPayload, UploadedImage};

pub const NOTICE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Transient message shown to the user; dismissed once its TTL passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    raised_at: Instant,
}

impl Notice {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.raised_at) >= ttl
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub response: String,
    /// `None` when the reply carried no model, or its model part was unusable.
    pub model: Option<ApplyOutcome>,
}

/// Everything one user sees: chat, current model, tabs, viewer, parameter
/// fields and notices. Actions never panic on backend failures; each one
/// records a notice and returns the error.
pub struct Studio<B: Backend> {
    backend: B,
    chat: Mutex<Option<ChatSession>>,
    tracker: Mutex<ModelStateTracker>,
    editor: Mutex<ParameterEditor>,
    presenter: Mutex<Option<ViewPresenter>>,
    viewer: Arc<Mutex<MeshViewer>>,
    redraw: Mutex<Option<RedrawLoop>>,
    notices: Mutex<Vec<Notice>>,
    notice_ttl: Duration,
    frame_interval: Duration,
}

impl<B: Backend> Studio<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            chat: Mutex::new(None),
            tracker: Mutex::new(ModelStateTracker::new()),
            editor: Mutex::new(ParameterEditor::default()),
            presenter: Mutex::new(None),
            viewer: Arc::new(Mutex::new(MeshViewer::new())),
            redraw: Mutex::new(None),
            notices: Mutex::new(Vec::new()),
            notice_ttl: NOTICE_TTL,
            frame_interval: FRAME_INTERVAL,
        }
    }

    pub fn with_notice_ttl(mut self, ttl: Duration) -> Self {
        self.notice_ttl = ttl;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn viewer(&self) -> Arc<Mutex<MeshViewer>> {
        self.viewer.clone()
    }

    pub async fn start_chat(&self) -> Result<Option<String>> {
        let started = ChatSession::start(&self.backend).await;
        let session = self.report("start chat", started).await?;
        let welcome = session
            .transcript()
            .first()
            .map(|line| line.text.clone());
        *self.chat.lock().await = Some(session);
        Ok(welcome)
    }

    /// A reply whose model part is malformed still returns its text; only the
    /// model update is skipped and reported.
    pub async fn send_message(&self, text: &str) -> Result<ChatOutcome> {
        let ticket = self.tracker.lock().await.begin_request();
        let reply = {
            let mut chat = self.chat.lock().await;
            match chat.as_mut() {
                Some(session) => session.send(&self.backend, text).await,
                None => Err(ClientError::NoSession),
            }
        };
        let reply = self.report("send message", reply).await?;

        let model = if reply.model.carries_model() {
            let applied = self.tracker.lock().await.apply(ticket, &reply.model);
            match self.report("update model", applied).await {
                Ok(outcome) => {
                    self.after_apply(outcome).await;
                    Some(outcome)
                }
                Err(_) => None,
            }
        } else {
            None
        };

        Ok(ChatOutcome {
            response: reply.response,
            model,
        })
    }

    /// Fresh generation from a free-text prompt.
    pub async fn generate(&self, prompt: &str) -> Result<ApplyOutcome> {
        let session_id = self.session_id().await;
        let request = GenerateRequest {
            prompt: Some(prompt.to_string()),
            session_id,
            ..GenerateRequest::default()
        };
        let result = self.run_generation(request).await;
        self.report("generate", result).await
    }

    pub async fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        let result = self.editor.lock().await.set(name, value);
        self.report("edit parameter", result).await
    }

    pub async fn reset_parameters(&self) -> Result<()> {
        let Some(state) = self.state().await else {
            return self
                .report("reset parameters", Err(ClientError::NoActiveModel))
                .await;
        };
        self.editor.lock().await.reset(&state);
        Ok(())
    }

    /// Regenerates the current model in place with the edited values.
    pub async fn submit_parameters(&self) -> Result<ApplyOutcome> {
        if self.tracker.lock().await.current().is_none() {
            return self
                .report("apply parameters", Err(ClientError::NoActiveModel))
                .await;
        }
        let session_id = self.session_id().await;
        let request = self.editor.lock().await.request(session_id.as_deref());
        let result = self.run_generation(request).await;
        self.report("apply parameters", result).await
    }

    pub async fn upload_image(&self, path: &Path) -> Result<ApplyOutcome> {
        let result = self.convert_image(path).await;
        self.report("image to 3D", result).await
    }

    pub async fn uploaded_images(&self) -> Result<Vec<UploadedImage>> {
        let images = self.backend.user_images().await;
        self.report("list images", images).await
    }

    /// Converts an image uploaded earlier without sending it again.
    pub async fn convert_upload(&self, file_id: &str) -> Result<ApplyOutcome> {
        let ticket = self.tracker.lock().await.begin_request();
        let result = self.convert(ticket, file_id).await;
        self.report("image to 3D", result).await
    }

    pub async fn purchase(
        &self,
        widget: &dyn PaymentWidget,
        package_id: &str,
    ) -> Result<PaymentReceipt> {
        let result = purchase(&self.backend, widget, package_id).await;
        let receipt = self.report("payment", result).await?;
        self.notify(
            NoticeLevel::Info,
            format!(
                "Added {} tokens, balance is now {}",
                receipt.tokens, receipt.new_balance
            ),
        )
        .await;
        Ok(receipt)
    }

    /// Switching to the mesh tab builds the viewer once, starts its redraw
    /// loop, and loads the current mesh.
    pub async fn select_tab(&self, tab: Tab) {
        {
            let mut presenter = self.presenter.lock().await;
            presenter
                .get_or_insert_with(|| ViewPresenter::new(None))
                .select(tab);
        }
        if tab != Tab::Mesh {
            return;
        }

        let first_activation = self.viewer.lock().await.activate();
        if first_activation {
            *self.redraw.lock().await =
                Some(RedrawLoop::spawn(self.viewer.clone(), self.frame_interval));
            self.reload_mesh().await;
        }
    }

    pub async fn view(&self) -> (ViewMode, View) {
        let presenter = *self.presenter.lock().await;
        let tracker = self.tracker.lock().await;
        match presenter {
            Some(presenter) => (presenter.mode(), presenter.render(tracker.current())),
            None => (ViewMode::Placeholder, View::Placeholder),
        }
    }

    pub async fn state(&self) -> Option<ModelState> {
        self.tracker.lock().await.current().cloned()
    }

    pub async fn parameters(&self) -> ParameterEditor {
        self.editor.lock().await.clone()
    }

    pub async fn transcript(&self) -> Vec<ChatLine> {
        match self.chat.lock().await.as_ref() {
            Some(session) => session.transcript().to_vec(),
            None => Vec::new(),
        }
    }

    /// Live notices; expired ones are dropped on read.
    pub async fn notices(&self) -> Vec<Notice> {
        let now = Instant::now();
        let mut notices = self.notices.lock().await;
        notices.retain(|notice| !notice.is_expired(now, self.notice_ttl));
        notices.clone()
    }

    async fn session_id(&self) -> Option<String> {
        self.chat
            .lock()
            .await
            .as_ref()
            .map(|session| session.session_id().to_string())
    }

    async fn run_generation(&self, request: GenerateRequest) -> Result<ApplyOutcome> {
        let ticket = self.tracker.lock().await.begin_request();
        let response = self.backend.generate(&request).await?;
        self.apply(ticket, &response.model).await
    }

    async fn convert_image(&self, path: &Path) -> Result<ApplyOutcome> {
        let image = ImageFile::read(path)?;
        let ticket = self.tracker.lock().await.begin_request();
        let receipt = self
            .backend
            .upload_image(&image.file_name, image.content_type, image.bytes)
            .await?;
        info!(file_id = %receipt.file_id, size = receipt.file_size, "image uploaded");
        self.convert(ticket, &receipt.file_id).await
    }

    async fn convert(&self, ticket: RequestTicket, file_id: &str) -> Result<ApplyOutcome> {
        let conversion = self
            .backend
            .generate_from_image(file_id, &BTreeMap::new())
            .await?;
        self.apply(ticket, &conversion.model).await
    }

    async fn apply(&self, ticket: RequestTicket, payload: &ModelPayload) -> Result<ApplyOutcome> {
        let outcome = self.tracker.lock().await.apply(ticket, payload)?;
        self.after_apply(outcome).await;
        Ok(outcome)
    }

    async fn after_apply(&self, outcome: ApplyOutcome) {
        if outcome == ApplyOutcome::Stale {
            return;
        }
        let Some(state) = self.state().await else {
            return;
        };
        *self.editor.lock().await = ParameterEditor::from_state(&state);
        self.presenter
            .lock()
            .await
            .get_or_insert_with(|| ViewPresenter::new(None))
            .observe(&state);
        info!(model_id = %state.model_id, revision = state.revision, "model updated");

        if self.viewer.lock().await.is_active() {
            self.reload_mesh().await;
        }
    }

    async fn reload_mesh(&self) {
        let Some(path) = self.state().await.and_then(|state| state.mesh_path) else {
            return;
        };
        // A failed load leaves the previous mesh up.
        let loaded = MeshViewer::load(&self.viewer, &self.backend, &path).await;
        let _ = self.report("load mesh", loaded).await;
    }

    async fn notify(&self, level: NoticeLevel, message: String) {
        self.notices.lock().await.push(Notice {
            level,
            message,
            raised_at: Instant::now(),
        });
    }

    async fn report<T>(&self, action: &str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            warn!(action, error = %err, "action failed");
            self.notify(NoticeLevel::Error, format!("{action} failed: {err}"))
                .await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use serde_json::json;

    use crate::error::ClientError;
    use crate::state::ApplyOutcome;
    use crate::testing::{
        FakeBackend, FakeWidget, VALID_SIGNATURE, box_stl, generated, model_payload,
    };
    use crate::view::{Tab, View, ViewMode};
    use crate::wire::{ChatReply, OrderStatus};

    use super::{NoticeLevel, Studio};

    fn studio(backend: FakeBackend) -> Studio<FakeBackend> {
        Studio::new(backend).with_frame_interval(Duration::from_millis(16))
    }

    #[tokio::test]
    async fn first_model_opens_preview_tab() {
        let backend = FakeBackend::new();
        backend.push_generation(Duration::ZERO, generated("m1", json!({"radius": "5"})));
        let studio = studio(backend);

        assert_eq!(studio.view().await, (ViewMode::Placeholder, View::Placeholder));
        studio.generate("a ball").await.expect("generation succeeds");

        let (mode, view) = studio.view().await;
        assert_eq!(mode, ViewMode::Tab(Tab::Preview));
        assert_eq!(view, View::PreviewImage("/preview/u1/m1".to_string()));
        assert_eq!(studio.parameters().await.field("radius"), Some("5"));
    }

    #[tokio::test]
    async fn preview_tab_opens_when_a_later_model_has_one() {
        let backend = FakeBackend::new();
        let mut unrendered = generated("m1", json!({"radius": "5"}));
        if let Ok(response) = unrendered.as_mut() {
            response.model.preview_url = None;
        }
        backend.push_generation(Duration::ZERO, unrendered);
        backend.push_generation(Duration::ZERO, generated("m2", json!({"width": "3"})));
        let studio = studio(backend);

        studio.generate("a ball").await.expect("first generation");
        assert_eq!(studio.view().await, (ViewMode::Placeholder, View::Placeholder));

        studio.generate("a box").await.expect("second generation");
        assert_eq!(
            studio.view().await,
            (
                ViewMode::Tab(Tab::Preview),
                View::PreviewImage("/preview/u1/m2".to_string())
            )
        );
    }

    #[tokio::test]
    async fn updates_do_not_change_selected_tab() {
        let backend = FakeBackend::new();
        backend.push_generation(Duration::ZERO, generated("m1", json!({"radius": "5"})));
        backend.push_generation(Duration::ZERO, generated("m2", json!({"width": "3"})));
        let studio = studio(backend);

        studio.generate("a ball").await.expect("first generation");
        studio.select_tab(Tab::Code).await;
        studio.generate("a box").await.expect("second generation");

        let (mode, view) = studio.view().await;
        assert_eq!(mode, ViewMode::Tab(Tab::Code));
        assert!(matches!(view, View::Code(code) if code.contains("m2")));
        let editor = studio.parameters().await;
        assert_eq!(editor.names().collect::<Vec<_>>(), vec!["width"]);
    }

    #[tokio::test]
    async fn regenerating_keeps_preview_and_reloads_mesh() {
        let backend = FakeBackend::new();
        backend.put_asset("/model/u1/m1.stl", box_stl([10.0, 10.0, 10.0]));
        backend.push_generation(Duration::ZERO, generated("m1", json!({"radius": "5"})));
        let studio = studio(backend);

        studio.generate("a ball").await.expect("generation succeeds");
        studio.select_tab(Tab::Mesh).await;
        let first = studio
            .viewer()
            .lock()
            .await
            .displayed()
            .cloned()
            .expect("mesh loaded on activation");

        studio
            .backend()
            .put_asset("/model/u1/m1.stl", box_stl([16.0, 10.0, 10.0]));
        let mut regenerated = generated("m1", json!({"radius": "8"}));
        if let Ok(response) = regenerated.as_mut() {
            response.model.revision = 2;
        }
        studio.backend().push_generation(Duration::ZERO, regenerated);

        studio.set_parameter("radius", "8").await.expect("radius is known");
        let outcome = studio
            .submit_parameters()
            .await
            .expect("regeneration succeeds");
        assert_eq!(outcome, ApplyOutcome::Applied { new_model: false });

        let sent = studio
            .backend()
            .generate_requests
            .lock()
            .expect("requests lock")
            .last()
            .cloned()
            .expect("request recorded");
        assert_eq!(sent.model_id.as_deref(), Some("m1"));
        assert_eq!(sent.parameters.get("radius").map(String::as_str), Some("8"));

        let state = studio.state().await.expect("model present");
        assert_eq!(state.preview_path.as_deref(), Some("/preview/u1/m1"));
        assert_eq!(state.revision, 2);

        let second = studio
            .viewer()
            .lock()
            .await
            .displayed()
            .cloned()
            .expect("mesh still displayed");
        assert_eq!(second.source_path, "/model/u1/m1.stl");
        assert_ne!(first.source_bounds, second.source_bounds);
        let fetches = studio
            .backend()
            .calls()
            .iter()
            .filter(|call| call.as_str() == "fetch_asset")
            .count();
        assert_eq!(fetches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_responses_do_not_regress_state() {
        let backend = FakeBackend::new();
        backend.push_generation(Duration::from_millis(50), generated("m_old", json!({"a": "1"})));
        backend.push_generation(Duration::from_millis(10), generated("m_new", json!({"b": "2"})));
        let studio = studio(backend);

        let (older, newer) = tokio::join!(studio.generate("first"), studio.generate("second"));
        assert_eq!(older.expect("stale is not an error"), ApplyOutcome::Stale);
        assert_eq!(
            newer.expect("newer applies"),
            ApplyOutcome::Applied { new_model: true }
        );
        assert_eq!(studio.state().await.expect("model").model_id, "m_new");
        assert_eq!(studio.parameters().await.names().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn failed_generation_keeps_state_and_raises_notice() {
        let backend = FakeBackend::new();
        backend.push_generation(Duration::ZERO, generated("m1", json!({"radius": "5"})));
        backend.push_generation(
            Duration::ZERO,
            Err(ClientError::Status {
                status: 402,
                message: "insufficient tokens".to_string(),
            }),
        );
        let studio = studio(backend);

        studio.generate("a ball").await.expect("first generation");
        let before = studio.state().await;
        let err = studio.generate("another").await.expect_err("402 fails");
        assert!(matches!(err, ClientError::Status { status: 402, .. }));
        assert_eq!(studio.state().await, before);

        let notices = studio.notices().await;
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
        assert!(notices[0].message.contains("insufficient tokens"));
    }

    #[tokio::test(start_paused = true)]
    async fn notices_dismiss_after_ttl() {
        let studio = studio(FakeBackend::new()).with_notice_ttl(Duration::from_secs(5));
        let _ = studio.submit_parameters().await;
        assert_eq!(studio.notices().await.len(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(studio.notices().await.len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(studio.notices().await.is_empty());
    }

    #[tokio::test]
    async fn chat_reply_with_malformed_model_keeps_text() {
        let backend = FakeBackend::new();
        let mut broken = model_payload("m1", json!({"radius": ["not", "scalar"]}));
        broken.preview_url = None;
        backend.push_chat_reply(Ok(ChatReply {
            response: "Here is your sphere".to_string(),
            model: broken,
        }));
        let studio = studio(backend);

        assert_eq!(
            studio.start_chat().await.expect("chat starts").as_deref(),
            Some("What would you like to build?")
        );
        let outcome = studio
            .send_message("make a sphere")
            .await
            .expect("chat text still arrives");
        assert_eq!(outcome.response, "Here is your sphere");
        assert!(outcome.model.is_none());
        assert!(studio.state().await.is_none());
        assert_eq!(studio.transcript().await.len(), 3);
        assert_eq!(studio.notices().await.len(), 1);
    }

    #[tokio::test]
    async fn message_without_session_is_rejected_locally() {
        let studio = studio(FakeBackend::new());
        let err = studio.send_message("hello").await.expect_err("no session");
        assert!(matches!(err, ClientError::NoSession));
        assert!(studio.backend().calls().is_empty());
    }

    #[tokio::test]
    async fn unsupported_image_makes_no_request() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("drawing.gif");
        std::fs::File::create(&path)
            .and_then(|mut file| file.write_all(b"GIF89a......"))
            .expect("write should succeed");
        let disguised = dir.path().join("drawing.png");
        std::fs::write(&disguised, b"GIF89a......").expect("write should succeed");

        let studio = studio(FakeBackend::new());
        for candidate in [&path, &disguised] {
            let err = studio
                .upload_image(candidate)
                .await
                .expect_err("gif is rejected");
            assert!(matches!(err, ClientError::UnsupportedImage(_)));
        }
        assert!(studio.backend().calls().is_empty());
        assert_eq!(studio.notices().await.len(), 2);
    }

    #[tokio::test]
    async fn image_upload_applies_image_model() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("photo.png");
        std::fs::write(&path, crate::upload::tests::PNG_MAGIC).expect("write should succeed");

        let backend = FakeBackend::new();
        let mut payload = model_payload("img_1", json!({}));
        payload.model_type = Some("image".to_string());
        payload.code = None;
        backend
            .conversions
            .lock()
            .expect("conversions lock")
            .push_back(Ok(crate::wire::ImageConversion {
                model: payload,
                processing_time: 1.5,
            }));
        let studio = studio(backend);

        studio.upload_image(&path).await.expect("conversion succeeds");
        assert_eq!(
            studio.backend().calls(),
            vec!["upload_image".to_string(), "generate_from_image".to_string()]
        );
        assert_eq!(
            studio.state().await.expect("model").kind,
            crate::state::ModelKind::Image
        );
    }

    #[tokio::test]
    async fn earlier_upload_converts_without_reupload() {
        let backend = FakeBackend::new();
        backend
            .uploads
            .lock()
            .expect("uploads lock")
            .push(crate::wire::UploadedImage {
                file_id: "a1.png".to_string(),
                file_size: 9,
                file_type: "image/png".to_string(),
                uploaded_at: "2026-01-01T00:00:00Z".to_string(),
            });
        let mut payload = model_payload("img_2", json!({}));
        payload.model_type = Some("image".to_string());
        backend
            .conversions
            .lock()
            .expect("conversions lock")
            .push_back(Ok(crate::wire::ImageConversion {
                model: payload,
                processing_time: 0.5,
            }));
        let studio = studio(backend);

        let images = studio.uploaded_images().await.expect("listing succeeds");
        assert_eq!(images.len(), 1);
        studio
            .convert_upload(&images[0].file_id)
            .await
            .expect("conversion succeeds");
        assert_eq!(
            studio.backend().calls(),
            vec!["user_images".to_string(), "generate_from_image".to_string()]
        );
        assert_eq!(studio.state().await.expect("model").model_id, "img_2");
    }

    #[tokio::test]
    async fn valid_payment_credits_tokens() {
        let studio = studio(FakeBackend::new());
        *studio.backend().balance.lock().expect("balance lock") = 7;
        let widget = FakeWidget {
            signature: VALID_SIGNATURE.to_string(),
        };

        let receipt = studio.purchase(&widget, "p1").await.expect("payment succeeds");
        assert_eq!(receipt.tokens, 100);
        assert_eq!(receipt.new_balance, 107);
        assert_eq!(receipt.status, OrderStatus::Completed);
        assert_eq!(
            studio
                .backend()
                .orders
                .lock()
                .expect("orders lock")
                .get(&receipt.order_id),
            Some(&OrderStatus::Completed)
        );
        assert_eq!(studio.notices().await[0].level, NoticeLevel::Info);
    }

    #[tokio::test]
    async fn invalid_signature_changes_nothing() {
        let studio = studio(FakeBackend::new());
        *studio.backend().balance.lock().expect("balance lock") = 7;
        let widget = FakeWidget {
            signature: "forged".to_string(),
        };

        let err = studio.purchase(&widget, "p1").await.expect_err("forged signature");
        assert!(matches!(err, ClientError::Rejected(_)));
        assert_eq!(*studio.backend().balance.lock().expect("balance lock"), 7);
        let orders = studio.backend().orders.lock().expect("orders lock").clone();
        assert!(orders.values().all(|status| *status == OrderStatus::Pending));
        assert_eq!(studio.notices().await[0].level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn mesh_load_failure_keeps_previous_mesh() {
        let backend = FakeBackend::new();
        backend.put_asset("/model/u1/m1.stl", box_stl([1.0, 2.0, 3.0]));
        backend.push_generation(Duration::ZERO, generated("m1", json!({})));
        backend.push_generation(Duration::ZERO, generated("m2", json!({})));
        let studio = studio(backend);

        studio.generate("first").await.expect("first generation");
        studio.select_tab(Tab::Mesh).await;
        let before = studio.viewer().lock().await.displayed().cloned();
        assert!(before.is_some());

        studio.generate("second").await.expect("second generation");
        assert_eq!(studio.state().await.expect("model").model_id, "m2");
        assert_eq!(studio.viewer().lock().await.displayed().cloned(), before);

        let notices = studio.notices().await;
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
        assert!(notices[0].message.starts_with("load mesh failed"));
    }
}
