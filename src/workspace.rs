//! Workspace - single source of truth
//!
//! Owns the scheduler, the spots controller and the scene, and routes change
//! events to the right recompute path:
//! - spots replaced: drop mapping, Full recolor, remap
//! - intensities, colormap or bounds: Full recolor
//! - border, opacity or colors: Cheap recolor
//! - per-spot or global scale: remap, then Cheap recolor
//!
//! Each batch of changes triggers at most one recolor, Full wins over Cheap.
//! The state lock is never held while calling the scheduler or observers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use crate::colormap;
use crate::config::Settings;
use crate::events::{EventSource, Subscription};
use crate::geometry::Geometry;
use crate::loaders::{
    MeasuresData, MeasuresSource, SpotLayout, LOAD_IMAGE, LOAD_MEASURES, LOAD_MESH, LOAD_SETTINGS,
};
use crate::mapper::{MapRequest, Mapping, MAP};
use crate::normalize::{Bounds, Scale};
use crate::recolor::RecolorMode;
use crate::scene::Scene;
use crate::scheduler::TaskScheduler;
use crate::spots::{Measure, Spot, SpotsController, SpotsError, SpotsEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceEvent {
    Spots(SpotsEvent),
    GeometryChanged,
    MappingChanged,
    ColorsChanged(RecolorMode),
    SettingsApplied,
}

/// Point-in-time copy of what an overlay consumer needs
#[derive(Debug, Clone)]
pub struct OverlaySnapshot {
    pub measure: Option<String>,
    pub scale: Scale,
    pub bounds: Bounds,
    pub geometry: Option<Arc<Geometry>>,
    pub mapping: Option<Mapping>,
    /// Color of primitives no spot covers, unless the geometry has its own
    pub base_color: [f32; 3],
    /// RGB floats, three per primitive
    pub colors: Option<Vec<f32>>,
}

#[derive(Default)]
struct WorkspaceState {
    spots: SpotsController,
    scene: Scene,
    /// Measure to select once measures arrive
    preferred_measure: Option<String>,
    pending_events: Vec<WorkspaceEvent>,
    pending_recolor: Option<RecolorMode>,
    pending_remap: bool,
    /// Sequence number of the latest remap; older mappings are dropped
    map_requests: u64,
}

/// What the caller has to do after the lock is released
struct Routed {
    events: Vec<WorkspaceEvent>,
    remap: Option<Option<MapRequest>>,
}

impl WorkspaceState {
    fn request_recolor(&mut self, mode: RecolorMode) {
        self.pending_recolor = Some(match self.pending_recolor {
            Some(pending) => pending.merge(mode),
            None => mode,
        });
    }

    fn route(&mut self) -> Routed {
        let mut events = Vec::new();
        for event in self.spots.drain_events() {
            match event {
                SpotsEvent::SpotsChanged => {
                    self.scene.invalidate_mapping();
                    self.request_recolor(RecolorMode::Full);
                    self.pending_remap = true;
                }
                SpotsEvent::IntensitiesChanged | SpotsEvent::MappingChanged => {
                    self.request_recolor(RecolorMode::Full);
                }
                SpotsEvent::BorderChanged | SpotsEvent::AttrChanged => {
                    self.request_recolor(RecolorMode::Cheap);
                }
                SpotsEvent::ScaleChanged => {
                    self.request_recolor(RecolorMode::Cheap);
                    self.pending_remap = true;
                }
                SpotsEvent::AutoMappingChanged | SpotsEvent::IntensitiesLoaded => {}
            }
            events.push(WorkspaceEvent::Spots(event));
        }
        events.append(&mut self.pending_events);

        if let Some(mode) = self.pending_recolor.take() {
            if self.scene.geometry().is_some() {
                self.scene.recolor(mode, &mut self.spots);
                events.push(WorkspaceEvent::ColorsChanged(mode));
            }
        }

        let remap = if std::mem::take(&mut self.pending_remap) {
            Some(self.map_request())
        } else {
            None
        };
        Routed { events, remap }
    }

    /// Starts a new remap round even when nothing can be mapped, so results
    /// of earlier rounds are rejected
    fn map_request(&mut self) -> Option<MapRequest> {
        self.map_requests += 1;
        let geometry = self.scene.geometry()?;
        if self.spots.spots().is_empty() {
            return None;
        }
        Some(MapRequest {
            geometry: Arc::clone(geometry),
            shapes: Arc::new(self.spots.shapes()),
            scale: self.spots.global_spot_scale(),
            spots_generation: self.spots.generation(),
            request: self.map_requests,
        })
    }

    fn set_geometry(&mut self, geometry: Option<Arc<Geometry>>) {
        self.scene.set_geometry(geometry);
        self.pending_events.push(WorkspaceEvent::GeometryChanged);
        // Spot colors are not computed while there is no geometry
        self.request_recolor(RecolorMode::Full);
        self.pending_remap = true;
    }

    fn apply_mapping(&mut self, mapping: Mapping) {
        if mapping.request != self.map_requests {
            debug!(
                "Dropping mapping from remap {}, latest is {}",
                mapping.request, self.map_requests
            );
            return;
        }
        if self.scene.set_mapping(mapping, &self.spots) {
            self.pending_events.push(WorkspaceEvent::MappingChanged);
            self.request_recolor(RecolorMode::Cheap);
        }
    }

    fn apply_measures(&mut self, data: MeasuresData) {
        info!(
            "Loaded {} spots with {} measures",
            data.spots.len(),
            data.measures.len()
        );
        self.spots.set_spots(data.spots);
        self.spots.set_measures(data.measures);
        if self.spots.measures().is_empty() {
            return;
        }
        let selected = match &self.preferred_measure {
            Some(name) => self.spots.select_measure_by_name(name),
            None => self.spots.select_measure(0),
        };
        if let Err(e) = selected {
            warn!("{}, selecting the first measure", e);
            if let Err(e) = self.spots.select_measure(0) {
                warn!("{}", e);
            }
        }
    }

    fn apply_settings(&mut self, settings: &Settings) -> Result<(), SpotsError> {
        if colormap::by_id(&settings.color_map).is_none() {
            return Err(SpotsError::UnknownColorMap(settings.color_map.clone()));
        }

        let spots = &mut self.spots;
        spots.set_color_map(&settings.color_map)?;
        spots.store_hotspot_quantile(settings.hotspot_quantile);
        spots.set_scale_id(settings.scale.id())?;
        // Manual bounds are kept unless the settings carry their own
        spots.set_auto_min_max(settings.auto_min_max);
        if !settings.auto_min_max {
            if let Some(min) = settings.min_value {
                spots.set_min_value(min);
            }
            if let Some(max) = settings.max_value {
                spots.set_max_value(max);
            }
        }
        spots.set_spot_border(settings.spot_border);
        spots.set_global_spot_opacity(settings.global_spot_opacity);
        spots.set_global_spot_scale(settings.global_spot_scale);
        spots.set_data_dependent_opacity(settings.data_dependent_opacity);

        self.scene.set_base_color(settings.base_color);
        self.request_recolor(RecolorMode::Cheap);
        self.pending_events.push(WorkspaceEvent::SettingsApplied);

        self.preferred_measure = settings.measure.clone();
        match &settings.measure {
            Some(name) if !self.spots.measures().is_empty() => {
                self.spots.select_measure_by_name(name)
            }
            _ => Ok(()),
        }
    }
}

struct Inner {
    state: Mutex<WorkspaceState>,
    scheduler: TaskScheduler,
    events: EventSource<WorkspaceEvent>,
}

/// Cheap to clone; clones share state
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<Inner>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(WorkspaceState::default()),
                scheduler: TaskScheduler::new(),
                events: EventSource::new(),
            }),
        }
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Workspace> {
        weak.upgrade().map(|inner| Workspace { inner })
    }

    fn lock(&self) -> MutexGuard<'_, WorkspaceState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `change` under the lock, then routes whatever it changed
    fn update<R>(&self, change: impl FnOnce(&mut WorkspaceState) -> R) -> R {
        let (result, routed) = {
            let mut state = self.lock();
            let result = change(&mut state);
            (result, state.route())
        };

        match routed.remap {
            Some(Some(request)) => self.start_mapping(request),
            Some(None) => {
                debug!("Skipping mapping: geometry or spots missing");
                self.inner.scheduler.cancel_task(MAP.key);
            }
            None => {}
        }
        for event in &routed.events {
            self.inner.events.notify(event);
        }
        result
    }

    fn start_mapping(&self, request: MapRequest) {
        let weak = self.weak();
        self.inner.scheduler.run_task_then(MAP, request, move |result| {
            let (Ok(mapping), Some(workspace)) = (result, Self::upgrade(&weak)) else {
                return;
            };
            workspace.update(|state| state.apply_mapping(mapping));
        });
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&WorkspaceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.events.unsubscribe(subscription)
    }

    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_idle().await;
    }

    pub fn status(&self) -> String {
        self.inner.scheduler.status()
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.scheduler.errors()
    }

    pub fn clear_errors(&self) {
        self.inner.scheduler.clear_errors();
    }

    // Loading

    /// Parses a measures CSV in the background, then replaces spots and
    /// measures. A failed parse leaves the current state untouched.
    pub fn load_measures(&self, data: Arc<[u8]>, layout: SpotLayout) {
        let weak = self.weak();
        let source = MeasuresSource { data, layout };
        self.inner
            .scheduler
            .run_task_then(LOAD_MEASURES, source, move |result| {
                let (Ok(data), Some(workspace)) = (result, Self::upgrade(&weak)) else {
                    return;
                };
                workspace.update(|state| state.apply_measures(data));
            });
    }

    /// Loads OBJ vertices as a surface geometry
    pub fn load_mesh(&self, data: Arc<[u8]>) {
        let weak = self.weak();
        self.inner.scheduler.run_task_then(LOAD_MESH, data, move |result| {
            let (Ok(geometry), Some(workspace)) = (result, Self::upgrade(&weak)) else {
                return;
            };
            workspace.set_geometry(geometry);
        });
    }

    /// Loads a raster image as an image geometry with its pixels as base colors
    pub fn load_image(&self, data: Arc<[u8]>) {
        let weak = self.weak();
        self.inner.scheduler.run_task_then(LOAD_IMAGE, data, move |result| {
            let (Ok(geometry), Some(workspace)) = (result, Self::upgrade(&weak)) else {
                return;
            };
            workspace.set_geometry(geometry);
        });
    }

    /// Settings are parsed and applied once every running task has finished
    pub fn load_settings(&self, text: Arc<str>) {
        let weak = self.weak();
        self.inner.scheduler.defer_until_idle(move || {
            let Some(workspace) = Self::upgrade(&weak) else {
                return;
            };
            debug!("Loading pending settings");
            let weak = workspace.weak();
            workspace
                .inner
                .scheduler
                .run_task_then(LOAD_SETTINGS, text, move |result| {
                    let (Ok(settings), Some(workspace)) = (result, Self::upgrade(&weak)) else {
                        return;
                    };
                    if let Err(e) = workspace.apply_settings(&settings) {
                        warn!("Settings partially applied: {}", e);
                    }
                });
        });
    }

    pub fn apply_settings(&self, settings: &Settings) -> Result<(), SpotsError> {
        self.update(|state| state.apply_settings(settings))
    }

    pub fn set_geometry(&self, geometry: Geometry) {
        self.update(|state| state.set_geometry(Some(Arc::new(geometry))));
    }

    pub fn clear_geometry(&self) {
        self.update(|state| state.set_geometry(None));
    }

    pub fn set_base_color(&self, color: [f32; 3]) {
        self.update(|state| {
            state.scene.set_base_color(color);
            state.request_recolor(RecolorMode::Cheap);
        });
    }

    // Spots controller setters

    pub fn set_spots(&self, spots: Vec<Spot>) {
        self.update(|state| state.spots.set_spots(spots));
    }

    pub fn set_measures(&self, measures: Vec<Measure>) {
        self.update(|state| state.spots.set_measures(measures));
    }

    pub fn select_measure(&self, index: usize) -> Result<(), SpotsError> {
        self.update(|state| state.spots.select_measure(index))
    }

    pub fn select_measure_by_name(&self, name: &str) -> Result<(), SpotsError> {
        self.update(|state| state.spots.select_measure_by_name(name))
    }

    pub fn set_scale_id(&self, id: &str) -> Result<(), SpotsError> {
        self.update(|state| state.spots.set_scale_id(id))
    }

    pub fn set_hotspot_quantile(&self, quantile: f64) {
        self.update(|state| state.spots.set_hotspot_quantile(quantile));
    }

    pub fn set_auto_min_max(&self, auto: bool) {
        self.update(|state| state.spots.set_auto_min_max(auto));
    }

    pub fn set_min_value(&self, min: f64) {
        self.update(|state| state.spots.set_min_value(min));
    }

    pub fn set_max_value(&self, max: f64) {
        self.update(|state| state.spots.set_max_value(max));
    }

    pub fn set_color_map(&self, id: &str) -> Result<(), SpotsError> {
        self.update(|state| state.spots.set_color_map(id))
    }

    pub fn set_spot_border(&self, border: f32) {
        self.update(|state| state.spots.set_spot_border(border));
    }

    pub fn set_global_spot_opacity(&self, opacity: f32) {
        self.update(|state| state.spots.set_global_spot_opacity(opacity));
    }

    pub fn set_global_spot_scale(&self, scale: f32) {
        self.update(|state| state.spots.set_global_spot_scale(scale));
    }

    pub fn set_spot_opacity(&self, opacity: &HashMap<String, f32>) {
        self.update(|state| state.spots.set_spot_opacity(opacity));
    }

    pub fn set_spot_scale(&self, scale: &HashMap<String, f32>) {
        self.update(|state| state.spots.set_spot_scale(scale));
    }

    pub fn set_spot_colors(&self, colors: &HashMap<String, [f32; 3]>) {
        self.update(|state| state.spots.set_spot_colors(colors));
    }

    pub fn set_data_dependent_opacity(&self, enabled: bool) {
        self.update(|state| state.spots.set_data_dependent_opacity(enabled));
    }

    // Queries

    pub fn spots(&self) -> Vec<Spot> {
        self.lock().spots.spots().to_vec()
    }

    pub fn measure_names(&self) -> Vec<String> {
        self.lock()
            .spots
            .measures()
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    /// Name of the spot painted on `primitive`
    pub fn spot_at(&self, primitive: usize) -> Option<String> {
        let state = self.lock();
        let index = state.scene.spot_at(primitive)?;
        state.spots.spots().get(index).map(|s| s.name.clone())
    }

    pub fn snapshot(&self) -> OverlaySnapshot {
        let state = self.lock();
        OverlaySnapshot {
            measure: state.spots.active_measure().map(|m| m.name.clone()),
            scale: state.spots.scale(),
            bounds: state.spots.bounds(),
            geometry: state.scene.geometry().cloned(),
            mapping: state.scene.mapping().cloned(),
            base_color: state.scene.base_color(),
            colors: state.scene.colors().map(<[f32]>::to_vec),
        }
    }
}
