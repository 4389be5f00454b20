//! Settings change state machine.

use std::fmt;

use cadence_core::SettingsSnapshot;
use tracing::debug;

use crate::error::{GpuError, Result};

/// Phase of a settings change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    /// Rendering normally.
    Steady,
    /// Waiting for all submitted work to retire.
    Draining,
    /// Destroying and recreating affected resources.
    Rebuilding,
    /// Re-issuing viewport and scissor state and retiring the setup recording.
    Reinitializing,
    /// A GPU failure interrupted a change. Terminal.
    Failed,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Steady => "steady",
            Self::Draining => "draining",
            Self::Rebuilding => "rebuilding",
            Self::Reinitializing => "reinitializing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which components a settings change must rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebuildPlan {
    pub surface: bool,
    pub depth: bool,
    pub multisample: bool,
    pub shadow_map: bool,
    pub sampler: bool,
}

impl RebuildPlan {
    /// Rebuild everything, as on initialization.
    pub const ALL: Self = Self {
        surface: true,
        depth: true,
        multisample: true,
        shadow_map: true,
        sampler: true,
    };

    pub const NONE: Self = Self {
        surface: false,
        depth: false,
        multisample: false,
        shadow_map: false,
        sampler: false,
    };

    pub const fn is_empty(&self) -> bool {
        !(self.surface || self.depth || self.multisample || self.shadow_map || self.sampler)
    }
}

/// Facts outside the settings themselves that affect the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlanContext {
    /// Multisampling is effective under the new settings.
    pub multisample_enabled: bool,
    /// The effective sample description differs from the current one.
    pub sample_desc_changed: bool,
    /// The backend bakes the present mode into the swap chain.
    pub vsync_requires_swapchain_rebuild: bool,
}

/// Field-by-field difference between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct SettingsDelta {
    pub size: bool,
    pub window_mode: bool,
    pub refresh_rate: bool,
    pub vsync: bool,
    pub anti_aliasing: bool,
    pub shadow_quality: bool,
    pub shadow_resolution: bool,
    pub soft_shadows: bool,
    pub filtering: bool,
    pub texture_quality: bool,
    pub mipmapping: bool,
}

impl SettingsDelta {
    pub fn between(old: &SettingsSnapshot, new: &SettingsSnapshot) -> Self {
        Self {
            size: old.display.width != new.display.width
                || old.display.height != new.display.height,
            window_mode: old.display.mode != new.display.mode,
            refresh_rate: old.display.refresh_rate != new.display.refresh_rate,
            vsync: old.display.vsync != new.display.vsync,
            anti_aliasing: old.anti_aliasing != new.anti_aliasing,
            shadow_quality: old.shadows.quality != new.shadows.quality,
            shadow_resolution: old.shadows.map_resolution != new.shadows.map_resolution,
            soft_shadows: old.shadows.soft_shadows != new.shadows.soft_shadows,
            filtering: old.textures.filtering_level != new.textures.filtering_level,
            texture_quality: old.textures.quality != new.textures.quality,
            mipmapping: old.textures.mipmapping != new.textures.mipmapping,
        }
    }

    /// No field changed at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Components this delta invalidates.
    pub const fn plan(&self, context: PlanContext) -> RebuildPlan {
        RebuildPlan {
            surface: self.size
                || self.window_mode
                || self.refresh_rate
                || (self.vsync && context.vsync_requires_swapchain_rebuild),
            depth: self.size || context.sample_desc_changed,
            multisample: context.sample_desc_changed
                || (self.size && context.multisample_enabled),
            shadow_map: self.shadow_quality || self.shadow_resolution,
            sampler: self.filtering,
        }
    }
}

/// Drives a settings change through drain, rebuild and reinitialization.
///
/// The coordinator holds the last applied snapshot. A request only replaces
/// it once the change reaches [`CoordinatorState::Steady`] again.
#[derive(Debug)]
pub struct SettingsCoordinator {
    state: CoordinatorState,
    snapshot: SettingsSnapshot,
    pending: Option<(SettingsSnapshot, RebuildPlan)>,
}

impl SettingsCoordinator {
    pub const fn new(snapshot: SettingsSnapshot) -> Self {
        Self {
            state: CoordinatorState::Steady,
            snapshot,
            pending: None,
        }
    }

    pub const fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Last applied settings.
    pub const fn snapshot(&self) -> &SettingsSnapshot {
        &self.snapshot
    }

    /// Settings and plan of the change in progress.
    pub const fn pending(&self) -> Option<&(SettingsSnapshot, RebuildPlan)> {
        self.pending.as_ref()
    }

    /// Fail with `EngineFailed` once the machine is terminal.
    pub fn ensure_usable(&self) -> Result<()> {
        if self.state == CoordinatorState::Failed {
            Err(GpuError::EngineFailed)
        } else {
            Ok(())
        }
    }

    /// Start a change.
    ///
    /// An empty plan commits `request` immediately and returns `false`; the
    /// machine stays steady and nothing is drained.
    pub fn begin(&mut self, request: SettingsSnapshot, plan: RebuildPlan) -> Result<bool> {
        self.ensure_usable()?;
        if self.state != CoordinatorState::Steady {
            return Err(GpuError::invalid_state(format!(
                "settings change requested while {}",
                self.state
            )));
        }
        if plan.is_empty() {
            self.snapshot = request;
            return Ok(false);
        }
        self.pending = Some((request, plan));
        self.transition(CoordinatorState::Steady, CoordinatorState::Draining)?;
        Ok(true)
    }

    /// Every submission has retired.
    pub fn drained(&mut self) -> Result<()> {
        self.transition(CoordinatorState::Draining, CoordinatorState::Rebuilding)
    }

    /// Every planned component has been rebuilt.
    pub fn rebuilt(&mut self) -> Result<()> {
        self.transition(CoordinatorState::Rebuilding, CoordinatorState::Reinitializing)
    }

    /// The setup recording retired. Commits the pending snapshot.
    pub fn reinitialized(&mut self) -> Result<()> {
        self.transition(CoordinatorState::Reinitializing, CoordinatorState::Steady)?;
        if let Some((snapshot, _)) = self.pending.take() {
            self.snapshot = snapshot;
        }
        Ok(())
    }

    /// Enter the terminal state.
    pub fn fail(&mut self) {
        if self.state != CoordinatorState::Failed {
            debug!(from = %self.state, "Settings coordinator failed");
        }
        self.state = CoordinatorState::Failed;
        self.pending = None;
    }

    fn transition(&mut self, from: CoordinatorState, to: CoordinatorState) -> Result<()> {
        self.ensure_usable()?;
        if self.state != from {
            return Err(GpuError::invalid_state(format!(
                "cannot move to {to} from {}, expected {from}",
                self.state
            )));
        }
        debug!(%from, %to, "Settings coordinator transition");
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{AntiAliasingSettings, ShadowQuality, TextureQuality, WindowMode};

    fn context() -> PlanContext {
        PlanContext::default()
    }

    #[test]
    fn identical_snapshots_have_empty_delta() {
        let snapshot = SettingsSnapshot::default();
        let delta = SettingsDelta::between(&snapshot, &snapshot);
        assert!(delta.is_empty());
        assert!(delta.plan(context()).is_empty());
    }

    #[test]
    fn resize_rebuilds_surface_and_depth() {
        let old = SettingsSnapshot::default();
        let mut new = old;
        new.display.width = 1920;
        new.display.height = 1080;
        let plan = SettingsDelta::between(&old, &new).plan(context());
        assert_eq!(
            plan,
            RebuildPlan {
                surface: true,
                depth: true,
                ..RebuildPlan::NONE
            }
        );

        let plan = SettingsDelta::between(&old, &new).plan(PlanContext {
            multisample_enabled: true,
            ..context()
        });
        assert!(plan.multisample);
    }

    #[test]
    fn mode_and_refresh_rebuild_surface_only() {
        let old = SettingsSnapshot::default();
        let mut new = old;
        new.display.mode = WindowMode::Borderless;
        new.display.refresh_rate = 144;
        let plan = SettingsDelta::between(&old, &new).plan(context());
        assert_eq!(
            plan,
            RebuildPlan {
                surface: true,
                ..RebuildPlan::NONE
            }
        );
    }

    #[test]
    fn vsync_depends_on_backend() {
        let old = SettingsSnapshot::default();
        let mut new = old;
        new.display.vsync = true;
        let delta = SettingsDelta::between(&old, &new);
        assert!(!delta.is_empty());
        assert!(delta.plan(context()).is_empty());
        assert!(
            delta
                .plan(PlanContext {
                    vsync_requires_swapchain_rebuild: true,
                    ..context()
                })
                .surface
        );
    }

    #[test]
    fn shadow_tier_rebuilds_shadow_map_only() {
        let mut old = SettingsSnapshot::default();
        old.shadows.quality = ShadowQuality::Low;
        let mut new = old;
        new.shadows.quality = ShadowQuality::Ultra;
        let plan = SettingsDelta::between(&old, &new).plan(context());
        assert_eq!(
            plan,
            RebuildPlan {
                shadow_map: true,
                ..RebuildPlan::NONE
            }
        );

        let mut soft = old;
        soft.shadows.soft_shadows = true;
        assert!(SettingsDelta::between(&old, &soft).plan(context()).is_empty());
    }

    #[test]
    fn anti_aliasing_follows_effective_samples() {
        let old = SettingsSnapshot::default();
        let mut new = old;
        new.anti_aliasing = AntiAliasingSettings::msaa(4);
        let delta = SettingsDelta::between(&old, &new);
        assert!(delta.anti_aliasing);
        // Probe says unsupported, nothing to rebuild.
        assert!(delta.plan(context()).is_empty());
        let plan = delta.plan(PlanContext {
            multisample_enabled: true,
            sample_desc_changed: true,
            ..context()
        });
        assert_eq!(
            plan,
            RebuildPlan {
                depth: true,
                multisample: true,
                ..RebuildPlan::NONE
            }
        );
    }

    #[test]
    fn texture_settings() {
        let old = SettingsSnapshot::default();
        let mut new = old;
        new.textures.quality = TextureQuality::Low;
        new.textures.mipmapping = false;
        assert!(SettingsDelta::between(&old, &new).plan(context()).is_empty());
        new.textures.filtering_level = 16;
        assert_eq!(
            SettingsDelta::between(&old, &new).plan(context()),
            RebuildPlan {
                sampler: true,
                ..RebuildPlan::NONE
            }
        );
    }

    #[test]
    fn full_cycle_commits_snapshot() {
        let mut coordinator = SettingsCoordinator::new(SettingsSnapshot::default());
        let mut request = SettingsSnapshot::default();
        request.display.width = 800;

        assert!(coordinator.begin(request, RebuildPlan::ALL).unwrap());
        assert_eq!(coordinator.state(), CoordinatorState::Draining);
        assert_eq!(coordinator.snapshot().display.width, 1280);
        coordinator.drained().unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Rebuilding);
        coordinator.rebuilt().unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Reinitializing);
        coordinator.reinitialized().unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Steady);
        assert_eq!(coordinator.snapshot().display.width, 800);
        assert!(coordinator.pending().is_none());
    }

    #[test]
    fn empty_plan_stays_steady() {
        let mut coordinator = SettingsCoordinator::new(SettingsSnapshot::default());
        let mut request = SettingsSnapshot::default();
        request.shadows.soft_shadows = true;
        assert!(!coordinator.begin(request, RebuildPlan::NONE).unwrap());
        assert_eq!(coordinator.state(), CoordinatorState::Steady);
        assert!(coordinator.snapshot().shadows.soft_shadows);
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut coordinator = SettingsCoordinator::new(SettingsSnapshot::default());
        assert!(matches!(coordinator.rebuilt(), Err(GpuError::InvalidState(_))));
        coordinator
            .begin(SettingsSnapshot::default(), RebuildPlan::ALL)
            .unwrap();
        assert!(matches!(
            coordinator.begin(SettingsSnapshot::default(), RebuildPlan::ALL),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            coordinator.reinitialized(),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn failed_is_terminal() {
        let mut coordinator = SettingsCoordinator::new(SettingsSnapshot::default());
        coordinator
            .begin(SettingsSnapshot::default(), RebuildPlan::ALL)
            .unwrap();
        coordinator.drained().unwrap();
        coordinator.fail();
        assert_eq!(coordinator.state(), CoordinatorState::Failed);
        assert_eq!(coordinator.rebuilt(), Err(GpuError::EngineFailed));
        assert_eq!(
            coordinator.begin(SettingsSnapshot::default(), RebuildPlan::NONE),
            Err(GpuError::EngineFailed)
        );
    }
}
