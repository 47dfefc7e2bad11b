use std::time::{Duration, Instant};

use render_protocol::Color;

use crate::damage::DamageMode;

pub const SHOW_FPS_ENV: &str = "COMPOSITOR_SHOW_FPS";
pub const DAMAGE_PROPAGATION_ENV: &str = "COMPOSITOR_DAMAGE_PROPAGATION";

/// How frame damage is computed and used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DamagePropagation {
    /// Collapse the frame damage to one bounding box.
    pub unified: bool,
    /// Restrict compositing to the damage accumulated on the reused target.
    pub use_for_compositing: bool,
}

impl DamagePropagation {
    pub fn frame_damage_mode(self) -> DamageMode {
        if self.unified {
            DamageMode::BoundingBox
        } else {
            DamageMode::Rectangles
        }
    }

    /// Parses `"none"`, `"region"` or `"unified"`, optionally suffixed with
    /// `"+compositing"`.
    pub fn from_name(value: &str) -> Option<Option<Self>> {
        let (mode, use_for_compositing) = match value.strip_suffix("+compositing") {
            Some(mode) => (mode, true),
            None => (value, false),
        };
        match mode {
            "none" => Some(None),
            "region" => Some(Some(Self {
                unified: false,
                use_for_compositing,
            })),
            "unified" => Some(Some(Self {
                unified: true,
                use_for_compositing,
            })),
            _ => None,
        }
    }
}

/// Compositing-thread settings, resolved once when the compositor is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositorSettings {
    /// `None` disables damage tracking; every frame is repainted in full.
    pub damage_propagation: Option<DamagePropagation>,
    pub swap_chain_depth: usize,
    pub fps_interval: Option<Duration>,
    pub feedback_capacity: usize,
    pub background_color: Color,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            damage_propagation: Some(DamagePropagation {
                unified: false,
                use_for_compositing: true,
            }),
            swap_chain_depth: Self::DEFAULT_SWAP_CHAIN_DEPTH,
            fps_interval: None,
            feedback_capacity: 16,
            background_color: Color::WHITE,
        }
    }
}

impl CompositorSettings {
    pub const DEFAULT_SWAP_CHAIN_DEPTH: usize = 3;

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(value) = lookup(SHOW_FPS_ENV) {
            match value.trim().parse::<f32>() {
                Ok(seconds) if seconds.is_finite() && seconds > 0.0 => {
                    settings.fps_interval = Some(Duration::from_secs_f32(seconds));
                }
                _ => tracing::warn!(variable = SHOW_FPS_ENV, %value, "expected a positive interval in seconds"),
            }
        }
        if let Some(value) = lookup(DAMAGE_PROPAGATION_ENV) {
            match DamagePropagation::from_name(value.trim()) {
                Some(damage) => settings.damage_propagation = damage,
                None => tracing::warn!(variable = DAMAGE_PROPAGATION_ENV, %value, "unknown damage propagation, ignoring"),
            }
        }
        settings
    }
}

/// Counts presented frames and logs the rate once per interval.
#[derive(Debug)]
pub struct FpsCounter {
    interval: Duration,
    window_start: Instant,
    frames: u32,
    last_fps: Option<f32>,
}

impl FpsCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            frames: 0,
            last_fps: None,
        }
    }

    /// Returns the rate when an interval just elapsed.
    pub fn frame_presented(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }
        let fps = self.frames as f32 / elapsed.as_secs_f32();
        tracing::info!(fps = format_args!("{fps:.1}"), "compositing");
        self.frames = 0;
        self.window_start = now;
        self.last_fps = Some(fps);
        Some(fps)
    }

    pub fn last_fps(&self) -> Option<f32> {
        self.last_fps
    }
}
