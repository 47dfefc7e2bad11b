use threads::PoolSizes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformProfile {
    Embedded,
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridPaintingStrategy {
    PreferCPUIfIdle,
    PreferGPUIfIdle,
    PreferGPUAboveMinimumArea,
    MinimumFractionOfTasksUsingGPU,
    CPUAffineRendering,
    GPUAffineRendering,
}

impl HybridPaintingStrategy {
    pub const ALL: [Self; 6] = [
        Self::PreferCPUIfIdle,
        Self::PreferGPUIfIdle,
        Self::PreferGPUAboveMinimumArea,
        Self::MinimumFractionOfTasksUsingGPU,
        Self::CPUAffineRendering,
        Self::GPUAffineRendering,
    ];

    pub fn default_for(profile: PlatformProfile) -> Self {
        match profile {
            PlatformProfile::Embedded => Self::CPUAffineRendering,
            PlatformProfile::Desktop => Self::GPUAffineRendering,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::PreferCPUIfIdle => "PreferCPUIfIdle",
            Self::PreferGPUIfIdle => "PreferGPUIfIdle",
            Self::PreferGPUAboveMinimumArea => "PreferGPUAboveMinimumArea",
            Self::MinimumFractionOfTasksUsingGPU => "MinimumFractionOfTasksUsingGPU",
            Self::CPUAffineRendering => "CPUAffineRendering",
            Self::GPUAffineRendering => "GPUAffineRendering",
        }
    }

    /// Exact, case-sensitive match on the strategy name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|strategy| strategy.name() == name)
    }
}

pub const CPU_PAINTING_THREADS_ENV: &str = "COMPOSITOR_CPU_PAINTING_THREADS";
pub const GPU_PAINTING_THREADS_ENV: &str = "COMPOSITOR_GPU_PAINTING_THREADS";
pub const GPU_PAINTING_MIN_AREA_ENV: &str = "COMPOSITOR_GPU_PAINTING_MIN_AREA";
pub const GPU_MIN_FRACTION_ENV: &str = "COMPOSITOR_GPU_MIN_FRACTION_OF_TASKS_IN_PERCENT";
pub const HYBRID_PAINTING_STRATEGY_ENV: &str = "COMPOSITOR_HYBRID_PAINTING_STRATEGY";
pub const USE_LINEAR_TILE_TEXTURES_ENV: &str = "COMPOSITOR_USE_LINEAR_TILE_TEXTURES";
pub const ENABLE_CPU_RENDERING_ENV: &str = "COMPOSITOR_ENABLE_CPU_RENDERING";

/// Tile painting settings, resolved once per rendering session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaintingConfig {
    pub cpu_painting_threads: usize,
    pub gpu_painting_threads: usize,
    pub gpu_painting_min_area: u64,
    /// Probability in `[0, 1]` that the random policy picks the GPU.
    pub gpu_min_fraction_of_tasks: f32,
    pub strategy: HybridPaintingStrategy,
    pub use_linear_tile_textures: bool,
    pub force_cpu_rendering: bool,
}

impl PaintingConfig {
    pub const DEFAULT_GPU_MIN_AREA: u64 = 256 * 256;
    pub const DEFAULT_GPU_MIN_FRACTION_PERCENT: u32 = 50;

    pub fn defaults(profile: PlatformProfile, sizes: PoolSizes) -> Self {
        Self {
            cpu_painting_threads: sizes.cpu_threads,
            gpu_painting_threads: sizes.gpu_threads,
            gpu_painting_min_area: Self::DEFAULT_GPU_MIN_AREA,
            gpu_min_fraction_of_tasks: Self::DEFAULT_GPU_MIN_FRACTION_PERCENT as f32 / 100.0,
            strategy: HybridPaintingStrategy::default_for(profile),
            use_linear_tile_textures: false,
            force_cpu_rendering: false,
        }
    }

    pub fn from_env(profile: PlatformProfile, can_use_accelerated_buffers: bool) -> Self {
        Self::from_lookup(
            profile,
            num_cpus::get(),
            can_use_accelerated_buffers,
            |name| std::env::var(name).ok(),
        )
    }

    pub fn from_lookup<F>(
        profile: PlatformProfile,
        cores: usize,
        can_use_accelerated_buffers: bool,
        lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let force_cpu_rendering = lookup(ENABLE_CPU_RENDERING_ENV).as_deref() == Some("1");
        let accelerated = can_use_accelerated_buffers && !force_cpu_rendering;
        let mut config = Self::defaults(profile, PoolSizes::for_cores(cores, accelerated));
        config.force_cpu_rendering = force_cpu_rendering;

        if let Some(threads) =
            parse_thread_count(&lookup, CPU_PAINTING_THREADS_ENV, PoolSizes::MAX_CPU_THREADS)
        {
            config.cpu_painting_threads = threads;
        }
        if let Some(threads) =
            parse_thread_count(&lookup, GPU_PAINTING_THREADS_ENV, PoolSizes::MAX_GPU_THREADS)
        {
            if accelerated {
                config.gpu_painting_threads = threads;
            } else if threads > 0 {
                tracing::info!(
                    threads,
                    "GPU painting threads requested but accelerated buffers are unavailable"
                );
            }
        }
        if let Some(area) = parse_unsigned(&lookup, GPU_PAINTING_MIN_AREA_ENV) {
            config.gpu_painting_min_area = area;
        }
        if let Some(percent) = parse_unsigned(&lookup, GPU_MIN_FRACTION_ENV) {
            config.gpu_min_fraction_of_tasks = (percent.min(100) as f32) / 100.0;
        }
        if let Some(name) = lookup(HYBRID_PAINTING_STRATEGY_ENV) {
            match HybridPaintingStrategy::from_name(&name) {
                Some(strategy) => config.strategy = strategy,
                None => tracing::warn!(%name, "unknown hybrid painting strategy, ignoring"),
            }
        }
        config.use_linear_tile_textures =
            lookup(USE_LINEAR_TILE_TEXTURES_ENV).as_deref() == Some("1");
        config
    }

    pub fn pool_sizes(&self) -> PoolSizes {
        PoolSizes {
            cpu_threads: self.cpu_painting_threads,
            gpu_threads: if self.force_cpu_rendering {
                0
            } else {
                self.gpu_painting_threads
            },
        }
    }
}

fn parse_unsigned<F>(lookup: &F, name: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(name)?;
    match value.trim().parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(variable = name, %value, "expected an unsigned integer, ignoring");
            None
        }
    }
}

fn parse_thread_count<F>(lookup: &F, name: &str, max: usize) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = parse_unsigned(lookup, name)?;
    match usize::try_from(parsed) {
        Ok(threads) if threads <= max => Some(threads),
        _ => {
            tracing::warn!(
                variable = name,
                value = parsed,
                max,
                "thread count out of range, using default"
            );
            None
        }
    }
}
