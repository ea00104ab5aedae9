use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modelgen_mesh::{BoundingBox, FitTransform, Mesh, VIEWPORT_SIZE, parse_stl};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::Result;

pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

const CAMERA_DISTANCE: f64 = 10.0;
const MAX_ELEVATION: f64 = 85.0 * std::f64::consts::PI / 180.0;

/// Where the viewer gets mesh bytes from.
#[async_trait]
pub trait MeshSource: Send + Sync {
    async fn fetch_mesh(&self, path: &str) -> Result<Vec<u8>>;
}

#[async_trait]
impl<B: Backend + ?Sized> MeshSource for B {
    async fn fetch_mesh(&self, path: &str) -> Result<Vec<u8>> {
        self.fetch_asset(path).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub fov_degrees: f64,
    pub position: [f64; 3],
    pub target: [f64; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub enum Light {
    Ambient { intensity: f64 },
    Directional { direction: [f64; 3], intensity: f64 },
}

/// Orbit around the target with damped angular velocity.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitControls {
    pub azimuth: f64,
    pub elevation: f64,
    pub distance: f64,
    pub damping: f64,
    velocity: [f64; 2],
}

impl OrbitControls {
    fn new(distance: f64) -> Self {
        Self {
            azimuth: 0.0,
            elevation: 0.0,
            distance,
            damping: 0.25,
            velocity: [0.0, 0.0],
        }
    }

    pub fn nudge(&mut self, d_azimuth: f64, d_elevation: f64) {
        self.velocity[0] += d_azimuth;
        self.velocity[1] += d_elevation;
    }

    fn update(&mut self) {
        self.azimuth += self.velocity[0];
        self.elevation = (self.elevation + self.velocity[1]).clamp(-MAX_ELEVATION, MAX_ELEVATION);
        let keep = 1.0 - self.damping;
        self.velocity = [self.velocity[0] * keep, self.velocity[1] * keep];
    }

    fn eye(&self, target: [f64; 3]) -> [f64; 3] {
        let horizontal = self.distance * self.elevation.cos();
        [
            target[0] + horizontal * self.azimuth.sin(),
            target[1] + self.distance * self.elevation.sin(),
            target[2] + horizontal * self.azimuth.cos(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub camera: Camera,
    pub lights: Vec<Light>,
    pub controls: OrbitControls,
}

impl Scene {
    fn build() -> Self {
        let controls = OrbitControls::new(CAMERA_DISTANCE);
        let target = [0.0, 0.0, 0.0];
        Self {
            camera: Camera {
                fov_degrees: 45.0,
                position: controls.eye(target),
                target,
            },
            lights: vec![
                Light::Ambient { intensity: 0.5 },
                Light::Directional {
                    direction: [1.0, 1.0, 1.0],
                    intensity: 0.8,
                },
            ],
            controls,
        }
    }
}

/// Mesh currently in the scene, already centered and scaled.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayedMesh {
    pub source_path: String,
    pub mesh: Mesh,
    pub transform: FitTransform,
    pub source_bounds: Option<BoundingBox>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub frame: u64,
    pub triangles: usize,
    pub camera_position: [f64; 3],
}

#[derive(Debug, Default)]
pub struct MeshViewer {
    scene: Option<Scene>,
    displayed: Option<DisplayedMesh>,
    loads_started: u64,
    shown_load: u64,
    frames: u64,
}

impl MeshViewer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the scene on first call. Returns false when already active.
    pub fn activate(&mut self) -> bool {
        if self.scene.is_some() {
            return false;
        }
        self.scene = Some(Scene::build());
        info!("mesh viewer initialised");
        true
    }

    pub fn is_active(&self) -> bool {
        self.scene.is_some()
    }

    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    pub fn scene_mut(&mut self) -> Option<&mut Scene> {
        self.scene.as_mut()
    }

    pub fn displayed(&self) -> Option<&DisplayedMesh> {
        self.displayed.as_ref()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Fetches and parses `path`, then swaps it in as the displayed mesh.
    ///
    /// The lock is not held across the fetch. If two loads overlap, the one
    /// started last wins. On any failure the previous mesh stays displayed,
    /// the error is logged and returned, and nothing is retried.
    pub async fn load(viewer: &Mutex<Self>, source: &dyn MeshSource, path: &str) -> Result<usize> {
        let load = {
            let mut guard = viewer.lock().await;
            guard.loads_started += 1;
            guard.loads_started
        };

        let parsed = match source.fetch_mesh(path).await {
            Ok(bytes) => parse_stl(&bytes).map_err(Into::into),
            Err(err) => Err(err),
        };
        let mesh = match parsed {
            Ok(mesh) => mesh,
            Err(err) => {
                warn!(path, error = %err, "mesh load failed, keeping previous mesh");
                return Err(err);
            }
        };

        let source_bounds = mesh.bounding_box();
        let (fitted, transform) = mesh.fit_to_viewport(VIEWPORT_SIZE);
        let triangles = fitted.triangles.len();

        let mut guard = viewer.lock().await;
        if load < guard.shown_load {
            debug!(path, load, "newer mesh already displayed");
            return Ok(triangles);
        }
        guard.shown_load = load;
        guard.displayed = Some(DisplayedMesh {
            source_path: path.to_string(),
            mesh: fitted,
            transform,
            source_bounds,
        });
        info!(path, triangles, scale = transform.scale, "mesh loaded");
        Ok(triangles)
    }

    /// Advances the controls and camera by one frame. No-op until activated.
    pub fn render_frame(&mut self) -> Option<FrameInfo> {
        let scene = self.scene.as_mut()?;
        scene.controls.update();
        scene.camera.position = scene.controls.eye(scene.camera.target);
        self.frames += 1;
        Some(FrameInfo {
            frame: self.frames,
            triangles: self
                .displayed
                .as_ref()
                .map_or(0, |displayed| displayed.mesh.triangles.len()),
            camera_position: scene.camera.position,
        })
    }
}

/// Per-frame redraw task. Keeps ticking whether or not the mesh tab is
/// visible; stops when dropped.
#[derive(Debug)]
pub struct RedrawLoop {
    handle: JoinHandle<()>,
}

impl RedrawLoop {
    pub fn spawn(viewer: Arc<Mutex<MeshViewer>>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                viewer.lock().await.render_frame();
            }
        });
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for RedrawLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
