pub mod backend;
pub mod chat;
pub mod config;
pub mod error;
pub mod library;
pub mod params;
pub mod payment;
pub mod state;
pub mod studio;
pub mod upload;
pub mod view;
pub mod viewer;
pub mod wire;

#[cfg(test)]
mod testing;

pub use backend::{Backend, HttpBackend};
pub use chat::{ChatLine, ChatSession, Role};
pub use config::{ClientConfig, ClientContext};
pub use error::{ClientError, Result};
pub use library::{ModelLibrary, SortOrder};
pub use params::{Parameter, ParameterEditor, ParameterSet};
pub use payment::{GatewayCallback, PaymentReceipt, PaymentWidget, purchase};
pub use state::{ApplyOutcome, ModelKind, ModelState, ModelStateTracker, RequestTicket};
pub use studio::{ChatOutcome, Notice, NoticeLevel, Studio};
pub use upload::ImageFile;
pub use view::{Tab, View, ViewMode, ViewPresenter};
pub use viewer::{MeshSource, MeshViewer, RedrawLoop};
