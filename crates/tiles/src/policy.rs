use rand::Rng;
use render_protocol::RenderingMode;
use threads::PoolOccupancy;

use crate::config::{HybridPaintingStrategy, PaintingConfig};

/// Chooses CPU or GPU rasterization for the next tile when both pools exist.
///
/// Decisions are queries over a snapshot of pool occupancy; nothing here mutates state.
/// Only [`HybridPaintingStrategy::MinimumFractionOfTasksUsingGPU`], and the affine
/// strategies once both pools are saturated, consume randomness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilePaintingPolicy {
    strategy: HybridPaintingStrategy,
    gpu_min_area: u64,
    gpu_probability: f32,
}

impl TilePaintingPolicy {
    pub fn new(strategy: HybridPaintingStrategy, gpu_min_area: u64, gpu_probability: f32) -> Self {
        Self {
            strategy,
            gpu_min_area,
            gpu_probability: gpu_probability.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &PaintingConfig) -> Self {
        Self::new(
            config.strategy,
            config.gpu_painting_min_area,
            config.gpu_min_fraction_of_tasks,
        )
    }

    pub fn strategy(&self) -> HybridPaintingStrategy {
        self.strategy
    }

    pub fn decide<R>(
        &self,
        occupancy: PoolOccupancy,
        area: u64,
        scale: f32,
        rng: &mut R,
    ) -> RenderingMode
    where
        R: Rng + ?Sized,
    {
        match (occupancy.cpu_capacity > 0, occupancy.gpu_capacity > 0) {
            (true, true) => {}
            (false, true) => return RenderingMode::Accelerated,
            _ => return RenderingMode::Unaccelerated,
        }

        match self.strategy {
            HybridPaintingStrategy::PreferCPUIfIdle => {
                if occupancy.cpu_has_spare_capacity() {
                    RenderingMode::Unaccelerated
                } else {
                    RenderingMode::Accelerated
                }
            }
            HybridPaintingStrategy::PreferGPUIfIdle => {
                if occupancy.gpu_has_spare_capacity() {
                    RenderingMode::Accelerated
                } else {
                    RenderingMode::Unaccelerated
                }
            }
            HybridPaintingStrategy::PreferGPUAboveMinimumArea => {
                if area >= self.gpu_min_area {
                    RenderingMode::Accelerated
                } else {
                    RenderingMode::Unaccelerated
                }
            }
            HybridPaintingStrategy::MinimumFractionOfTasksUsingGPU => self.random_fraction(rng),
            HybridPaintingStrategy::CPUAffineRendering => {
                if scale != 1.0 {
                    RenderingMode::Accelerated
                } else if occupancy.cpu_has_spare_capacity() {
                    RenderingMode::Unaccelerated
                } else if occupancy.gpu_has_spare_capacity() {
                    RenderingMode::Accelerated
                } else {
                    self.random_fraction(rng)
                }
            }
            HybridPaintingStrategy::GPUAffineRendering => {
                if scale != 1.0 || occupancy.gpu_has_spare_capacity() {
                    RenderingMode::Accelerated
                } else if occupancy.cpu_has_spare_capacity() {
                    RenderingMode::Unaccelerated
                } else {
                    self.random_fraction(rng)
                }
            }
        }
    }

    fn random_fraction<R>(&self, rng: &mut R) -> RenderingMode
    where
        R: Rng + ?Sized,
    {
        if rng.random::<f32>() < self.gpu_probability {
            RenderingMode::Accelerated
        } else {
            RenderingMode::Unaccelerated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn occupancy(cpu_tasks: usize, gpu_tasks: usize) -> PoolOccupancy {
        PoolOccupancy {
            cpu_tasks,
            cpu_capacity: 2,
            gpu_tasks,
            gpu_capacity: 2,
        }
    }

    #[test]
    fn deterministic_strategies_repeat_their_answer() {
        let mut rng = StdRng::seed_from_u64(7);
        let inputs = [
            (occupancy(0, 0), 100, 1.0),
            (occupancy(2, 1), 70_000, 1.0),
            (occupancy(2, 2), 10, 1.0),
            (occupancy(1, 2), 10, 2.0),
        ];
        for strategy in [
            HybridPaintingStrategy::PreferCPUIfIdle,
            HybridPaintingStrategy::PreferGPUIfIdle,
            HybridPaintingStrategy::PreferGPUAboveMinimumArea,
        ] {
            let policy = TilePaintingPolicy::new(strategy, 65536, 0.5);
            for (occupancy, area, scale) in inputs {
                let first = policy.decide(occupancy, area, scale, &mut rng);
                for _ in 0..16 {
                    assert_eq!(policy.decide(occupancy, area, scale, &mut rng), first);
                }
            }
        }
    }

    #[test]
    fn idle_preferences_follow_spare_capacity() {
        let mut rng = StdRng::seed_from_u64(1);
        let cpu_first = TilePaintingPolicy::new(HybridPaintingStrategy::PreferCPUIfIdle, 0, 0.5);
        assert_eq!(
            cpu_first.decide(occupancy(1, 2), 0, 1.0, &mut rng),
            RenderingMode::Unaccelerated
        );
        assert_eq!(
            cpu_first.decide(occupancy(2, 2), 0, 1.0, &mut rng),
            RenderingMode::Accelerated
        );

        let gpu_first = TilePaintingPolicy::new(HybridPaintingStrategy::PreferGPUIfIdle, 0, 0.5);
        assert_eq!(
            gpu_first.decide(occupancy(0, 1), 0, 1.0, &mut rng),
            RenderingMode::Accelerated
        );
        assert_eq!(
            gpu_first.decide(occupancy(0, 2), 0, 1.0, &mut rng),
            RenderingMode::Unaccelerated
        );
    }

    #[test]
    fn area_threshold_is_inclusive() {
        let mut rng = StdRng::seed_from_u64(1);
        let policy =
            TilePaintingPolicy::new(HybridPaintingStrategy::PreferGPUAboveMinimumArea, 4096, 0.5);
        assert_eq!(
            policy.decide(occupancy(0, 0), 4096, 1.0, &mut rng),
            RenderingMode::Accelerated
        );
        assert_eq!(
            policy.decide(occupancy(0, 0), 4095, 1.0, &mut rng),
            RenderingMode::Unaccelerated
        );
    }

    #[test]
    fn random_fraction_honours_extremes_and_rough_ratio() {
        let mut rng = StdRng::seed_from_u64(42);
        let strategy = HybridPaintingStrategy::MinimumFractionOfTasksUsingGPU;
        let never = TilePaintingPolicy::new(strategy, 0, 0.0);
        let always = TilePaintingPolicy::new(strategy, 0, 1.0);
        let quarter = TilePaintingPolicy::new(strategy, 0, 0.25);
        let mut gpu_count = 0;
        for _ in 0..4000 {
            assert_eq!(
                never.decide(occupancy(0, 0), 0, 1.0, &mut rng),
                RenderingMode::Unaccelerated
            );
            assert_eq!(
                always.decide(occupancy(0, 0), 0, 1.0, &mut rng),
                RenderingMode::Accelerated
            );
            if quarter.decide(occupancy(0, 0), 0, 1.0, &mut rng) == RenderingMode::Accelerated {
                gpu_count += 1;
            }
        }
        assert!((800..1200).contains(&gpu_count), "gpu_count = {gpu_count}");
    }

    #[test]
    fn affine_strategies_send_scaled_tiles_to_gpu() {
        let mut rng = StdRng::seed_from_u64(3);
        for strategy in [
            HybridPaintingStrategy::CPUAffineRendering,
            HybridPaintingStrategy::GPUAffineRendering,
        ] {
            let policy = TilePaintingPolicy::new(strategy, 0, 0.0);
            assert_eq!(
                policy.decide(occupancy(0, 2), 10, 1.5, &mut rng),
                RenderingMode::Accelerated
            );
        }
    }

    #[test]
    fn cpu_affine_prefers_cpu_then_gpu_then_random() {
        let mut rng = StdRng::seed_from_u64(3);
        let policy = TilePaintingPolicy::new(HybridPaintingStrategy::CPUAffineRendering, 0, 0.0);
        assert_eq!(
            policy.decide(occupancy(1, 0), 10, 1.0, &mut rng),
            RenderingMode::Unaccelerated
        );
        assert_eq!(
            policy.decide(occupancy(2, 1), 10, 1.0, &mut rng),
            RenderingMode::Accelerated
        );
        // Both saturated with a zero GPU fraction: always CPU.
        assert_eq!(
            policy.decide(occupancy(2, 2), 10, 1.0, &mut rng),
            RenderingMode::Unaccelerated
        );

        let gpu_affine =
            TilePaintingPolicy::new(HybridPaintingStrategy::GPUAffineRendering, 0, 1.0);
        assert_eq!(
            gpu_affine.decide(occupancy(0, 2), 10, 1.0, &mut rng),
            RenderingMode::Unaccelerated
        );
        assert_eq!(
            gpu_affine.decide(occupancy(2, 2), 10, 1.0, &mut rng),
            RenderingMode::Accelerated
        );
    }

    #[test]
    fn single_pool_bypasses_strategy() {
        let mut rng = StdRng::seed_from_u64(5);
        let policy = TilePaintingPolicy::new(HybridPaintingStrategy::PreferCPUIfIdle, 0, 0.5);
        let cpu_only = PoolOccupancy {
            cpu_tasks: 9,
            cpu_capacity: 1,
            gpu_tasks: 0,
            gpu_capacity: 0,
        };
        let gpu_only = PoolOccupancy {
            cpu_tasks: 0,
            cpu_capacity: 0,
            gpu_tasks: 9,
            gpu_capacity: 1,
        };
        assert_eq!(
            policy.decide(cpu_only, 0, 2.0, &mut rng),
            RenderingMode::Unaccelerated
        );
        assert_eq!(
            policy.decide(gpu_only, 0, 1.0, &mut rng),
            RenderingMode::Accelerated
        );
    }
}
