//! Periodic fleet snapshot
//!
//! On a fixed cadence the scheduler copies the store, turns every located
//! record into a map marker, renders the markers and replaces the published
//! artifact. The cadence does not depend on report traffic, and a failed
//! tick is logged and skipped.

use crate::error::RenderError;
use crate::presence::PresenceRecord;
use crate::store::PresenceStore;
use crate::utils::marker_color;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// One map marker per located entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub online: bool,
}

impl Marker {
    pub fn from_record(record: &PresenceRecord) -> Option<Self> {
        record.location.map(|location| Self {
            id: record.id.clone(),
            lat: location.lat,
            lng: location.lng,
            online: record.online,
        })
    }

    pub fn color(&self) -> &'static str {
        marker_color(self.online)
    }
}

/// Turns a set of markers into a viewable artifact.
#[async_trait]
pub trait SnapshotRenderer: Send + Sync {
    async fn render(&self, markers: &[Marker]) -> Result<Vec<u8>, RenderError>;
}

/// Destination of rendered snapshots. Each call fully replaces the previous
/// artifact.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn replace(&self, artifact: Vec<u8>) -> Result<(), RenderError>;
}

/// Renders a self-contained Leaflet page.
#[derive(Debug, Clone)]
pub struct HtmlMapRenderer {
    pub center: (f64, f64),
    pub zoom: u8,
    pub title: String,
}

impl Default for HtmlMapRenderer {
    fn default() -> Self {
        Self {
            center: (0.0, 0.0),
            zoom: 2,
            title: "Fleet".to_string(),
        }
    }
}

impl HtmlMapRenderer {
    pub fn new(center: (f64, f64), zoom: u8) -> Self {
        Self {
            center,
            zoom,
            ..Default::default()
        }
    }

    pub fn render_html(&self, markers: &[Marker]) -> Result<String, RenderError> {
        let mut html = String::with_capacity(1024 + markers.len() * 160);
        self.write_html(&mut html, markers)
            .map_err(|e| RenderError::Render(e.to_string()))?;
        Ok(html)
    }

    fn write_html(&self, out: &mut String, markers: &[Marker]) -> std::fmt::Result {
        writeln!(out, "<!DOCTYPE html>")?;
        writeln!(out, "<html>\n<head>")?;
        writeln!(out, "<meta charset=\"utf-8\">")?;
        writeln!(out, "<title>{}</title>", escape_html(&self.title))?;
        writeln!(
            out,
            "<link rel=\"stylesheet\" href=\"https://unpkg.com/leaflet@1.9.4/dist/leaflet.css\">"
        )?;
        writeln!(
            out,
            "<script src=\"https://unpkg.com/leaflet@1.9.4/dist/leaflet.js\"></script>"
        )?;
        writeln!(
            out,
            "<style>html, body, #map {{ height: 100%; margin: 0; }}</style>"
        )?;
        writeln!(out, "</head>\n<body>\n<div id=\"map\"></div>\n<script>")?;
        writeln!(
            out,
            "var map = L.map('map').setView([{}, {}], {});",
            self.center.0, self.center.1, self.zoom
        )?;
        writeln!(
            out,
            "L.tileLayer('https://{{s}}.tile.openstreetmap.org/{{z}}/{{x}}/{{y}}.png', {{ attribution: '&copy; OpenStreetMap contributors' }}).addTo(map);"
        )?;

        for marker in markers {
            writeln!(
                out,
                "L.circleMarker([{}, {}], {{ color: '{}', fillColor: '{}', fillOpacity: 0.8, radius: 8 }}).bindPopup({}).addTo(map);",
                marker.lat,
                marker.lng,
                marker.color(),
                marker.color(),
                js_string(&format!("User: {}", escape_html(&marker.id)))
            )?;
        }

        writeln!(out, "</script>\n</body>\n</html>")
    }
}

#[async_trait]
impl SnapshotRenderer for HtmlMapRenderer {
    async fn render(&self, markers: &[Marker]) -> Result<Vec<u8>, RenderError> {
        self.render_html(markers).map(String::into_bytes)
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

// JSON string literals are valid JavaScript string literals
fn js_string(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

/// Snapshot stored on disk, replaced through a temp file and a rename so
/// readers never see a partial artifact.
#[derive(Debug, Clone)]
pub struct FileArtifact {
    path: PathBuf,
}

impl FileArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current artifact, None if none has been written yet.
    pub async fn read(&self) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ArtifactSink for FileArtifact {
    async fn replace(&self, artifact: Vec<u8>) -> Result<(), RenderError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&artifact).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

/// Keeps the latest artifact in memory.
#[derive(Debug, Default)]
pub struct MemoryArtifact {
    latest: Mutex<Option<Arc<Vec<u8>>>>,
    version: AtomicU64,
}

impl MemoryArtifact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Arc<Vec<u8>>> {
        self.latest.lock().clone()
    }

    /// Number of times the artifact has been replaced.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSink for MemoryArtifact {
    async fn replace(&self, artifact: Vec<u8>) -> Result<(), RenderError> {
        *self.latest.lock() = Some(Arc::new(artifact));
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Rendering,
}

const STATE_IDLE: u8 = 0;
const STATE_RENDERING: u8 = 1;

/// Shortest tick period accepted by the scheduler.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

pub struct SnapshotScheduler {
    store: Arc<PresenceStore>,
    renderer: Arc<dyn SnapshotRenderer>,
    sink: Arc<dyn ArtifactSink>,
    period: Duration,
    state: AtomicU8,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl SnapshotScheduler {
    pub fn new(
        store: Arc<PresenceStore>,
        renderer: Arc<dyn SnapshotRenderer>,
        sink: Arc<dyn ArtifactSink>,
        period: Duration,
    ) -> Self {
        Self {
            store,
            renderer,
            sink,
            period: period.max(MIN_PERIOD),
            state: AtomicU8::new(STATE_IDLE),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> SchedulerState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RENDERING => SchedulerState::Rendering,
            _ => SchedulerState::Idle,
        }
    }

    pub fn completed_ticks(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed_ticks(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Renders and publishes one snapshot. Returns the number of markers.
    pub async fn tick(&self) -> Result<usize, RenderError> {
        self.state.store(STATE_RENDERING, Ordering::SeqCst);
        let result = self.render_once().await;
        self.state.store(STATE_IDLE, Ordering::SeqCst);

        match &result {
            Ok(_) => self.completed.fetch_add(1, Ordering::SeqCst),
            Err(_) => self.failed.fetch_add(1, Ordering::SeqCst),
        };
        result
    }

    async fn render_once(&self) -> Result<usize, RenderError> {
        // The only store access; rendering below runs without any store lock
        let records = self.store.list();
        let markers: Vec<Marker> = records.iter().filter_map(Marker::from_record).collect();

        let artifact = self.renderer.render(&markers).await?;
        self.sink.replace(artifact).await?;
        Ok(markers.len())
    }

    /// Runs the tick loop until `shutdown` flips to true.
    ///
    /// The first tick fires immediately so a snapshot exists right after
    /// startup. Ticks missed while a render overran are skipped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Snapshot scheduler started, period {:?}", self.period);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match self.tick().await {
                            Ok(count) => debug!("Snapshot rendered with {} markers", count),
                            Err(e) => warn!("Snapshot tick skipped: {}", e),
                        }
                    }
                }
            }

            info!("Snapshot scheduler stopped");
        })
    }
}
