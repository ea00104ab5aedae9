use crate::state::ModelState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tab {
    Code,
    Preview,
    Mesh,
}

impl Tab {
    pub const ALL: [Tab; 3] = [Tab::Code, Tab::Preview, Tab::Mesh];

    pub fn label(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Preview => "preview",
            Self::Mesh => "3d",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "code" => Some(Self::Code),
            "preview" | "image" => Some(Self::Preview),
            "3d" | "mesh" => Some(Self::Mesh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    Placeholder,
    Tab(Tab),
}

/// What the active tab shows for the current model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    Placeholder,
    Code(String),
    PreviewImage(String),
    Mesh(String),
    Unavailable(Tab),
}

/// Tracks only which tab is active. Model data is read at render time and
/// never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewPresenter {
    mode: ViewMode,
}

impl ViewPresenter {
    pub fn new(state: Option<&ModelState>) -> Self {
        let mode = match state {
            Some(state) if state.preview_path.is_some() => ViewMode::Tab(Tab::Preview),
            _ => ViewMode::Placeholder,
        };
        Self { mode }
    }

    /// Re-applies the opening rule for a newly applied model while nothing is
    /// shown yet. A tab that is already active stays as it is.
    pub fn observe(&mut self, state: &ModelState) {
        if self.mode == ViewMode::Placeholder {
            *self = Self::new(Some(state));
        }
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn active_tab(&self) -> Option<Tab> {
        match self.mode {
            ViewMode::Tab(tab) => Some(tab),
            ViewMode::Placeholder => None,
        }
    }

    pub fn select(&mut self, tab: Tab) {
        self.mode = ViewMode::Tab(tab);
    }

    pub fn render(&self, state: Option<&ModelState>) -> View {
        let (ViewMode::Tab(tab), Some(state)) = (self.mode, state) else {
            return View::Placeholder;
        };
        let content = match tab {
            Tab::Code => state.code.clone().map(View::Code),
            Tab::Preview => state.preview_path.clone().map(View::PreviewImage),
            Tab::Mesh => state.mesh_path.clone().map(View::Mesh),
        };
        content.unwrap_or(View::Unavailable(tab))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::state::ModelState;
    use crate::wire::ModelPayload;

    use super::{Tab, View, ViewMode, ViewPresenter};

    fn state(preview: Option<&str>) -> ModelState {
        ModelState::from_payload(&ModelPayload {
            model_id: Some("m1".to_string()),
            code: Some("cube(size);".to_string()),
            preview_url: preview.map(str::to_string),
            mesh_url: Some("/model/u1/m1.stl".to_string()),
            parameters: Some(json!({"size": "10"})),
            ..ModelPayload::default()
        })
        .expect("payload should be valid")
    }

    #[test]
    fn starts_on_preview_when_available() {
        let with_preview = state(Some("/preview/u1/m1"));
        assert_eq!(
            ViewPresenter::new(Some(&with_preview)).mode(),
            ViewMode::Tab(Tab::Preview)
        );
        assert_eq!(
            ViewPresenter::new(Some(&state(None))).mode(),
            ViewMode::Placeholder
        );
        assert_eq!(ViewPresenter::new(None).mode(), ViewMode::Placeholder);
    }

    #[test]
    fn placeholder_opens_once_a_preview_arrives() {
        let mut presenter = ViewPresenter::new(Some(&state(None)));
        presenter.observe(&state(None));
        assert_eq!(presenter.mode(), ViewMode::Placeholder);

        presenter.observe(&state(Some("/preview/u1/m2")));
        assert_eq!(presenter.mode(), ViewMode::Tab(Tab::Preview));

        presenter.select(Tab::Code);
        presenter.observe(&state(Some("/preview/u1/m3")));
        assert_eq!(presenter.mode(), ViewMode::Tab(Tab::Code));
    }

    #[test]
    fn switching_tabs_never_mutates_model_data() {
        let model = state(Some("/preview/u1/m1"));
        let snapshot = model.clone();
        let mut presenter = ViewPresenter::new(Some(&model));

        for tab in [Tab::Code, Tab::Mesh, Tab::Preview, Tab::Code, Tab::Mesh] {
            presenter.select(tab);
            let _ = presenter.render(Some(&model));
            assert_eq!(presenter.active_tab(), Some(tab));
            assert_eq!(model, snapshot);
        }
    }

    #[test]
    fn render_reads_current_fields() {
        let model = state(None);
        let mut presenter = ViewPresenter::new(Some(&model));
        assert_eq!(presenter.render(Some(&model)), View::Placeholder);

        presenter.select(Tab::Code);
        assert_eq!(presenter.render(Some(&model)), View::Code("cube(size);".to_string()));
        presenter.select(Tab::Mesh);
        assert_eq!(presenter.render(Some(&model)), View::Mesh("/model/u1/m1.stl".to_string()));
        presenter.select(Tab::Preview);
        assert_eq!(presenter.render(Some(&model)), View::Unavailable(Tab::Preview));
    }

    #[test]
    fn labels_round_trip() {
        for tab in Tab::ALL {
            assert_eq!(Tab::from_label(tab.label()), Some(tab));
        }
        assert_eq!(Tab::from_label("wireframe"), None);
    }
}
