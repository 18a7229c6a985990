//! Noise-based procedural height field

use glam::Vec3;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

/// Parameters controlling terrain generation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TerrainParams {
    pub seed: u32,
    pub scale: f32,        // Horizontal scale (larger = smoother)
    pub height_scale: f32, // Vertical scale (max height)
    pub octaves: u32,      // FBM octaves (detail levels)
    pub persistence: f32,  // FBM persistence (0.5 typical)
    pub lacunarity: f32,   // FBM lacunarity (2.0 typical)
    pub sea_level: f32,    // Height below which is "water"
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            seed: 12345,
            scale: 100.0,
            height_scale: 64.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            sea_level: 16.0,
        }
    }
}

/// Procedural terrain generator using fractal Brownian motion (FBM)
pub struct TerrainGenerator {
    params: TerrainParams,
    noise: Fbm<Perlin>,
}

impl TerrainGenerator {
    pub fn new(params: TerrainParams) -> Self {
        let noise = Fbm::<Perlin>::new(params.seed)
            .set_octaves(params.octaves as usize)
            .set_persistence(params.persistence as f64)
            .set_lacunarity(params.lacunarity as f64);

        Self { params, noise }
    }

    pub fn params(&self) -> &TerrainParams {
        &self.params
    }

    /// Terrain height at world position (x, z), in [0, height_scale]
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        let nx = (x / self.params.scale) as f64;
        let nz = (z / self.params.scale) as f64;

        // Noise is roughly [-1, 1]; clamp the overshoot FBM can produce
        let noise_value = self.noise.get([nx, nz]).clamp(-1.0, 1.0);
        let normalized = (noise_value + 1.0) / 2.0;
        (normalized * self.params.height_scale as f64) as f32
    }

    /// Surface normal from central differences over `eps`
    pub fn normal_at(&self, x: f32, z: f32, eps: f32) -> Vec3 {
        let dh_dx = (self.height_at(x + eps, z) - self.height_at(x - eps, z)) / (2.0 * eps);
        let dh_dz = (self.height_at(x, z + eps) - self.height_at(x, z - eps)) / (2.0 * eps);
        Vec3::new(-dh_dx, 1.0, -dh_dz).normalize()
    }

    /// Min/max height sampled at the corners and center of an XZ region
    pub fn height_bounds(&self, min_x: f32, max_x: f32, min_z: f32, max_z: f32) -> (f32, f32) {
        let heights = [
            self.height_at(min_x, min_z),
            self.height_at(max_x, min_z),
            self.height_at(min_x, max_z),
            self.height_at(max_x, max_z),
            self.height_at((min_x + max_x) / 2.0, (min_z + max_z) / 2.0),
        ];

        let min_h = heights.iter().copied().fold(f32::INFINITY, f32::min);
        let max_h = heights.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        (min_h, max_h)
    }

    /// Albedo for a surface point, banded by height and slope
    pub fn surface_color(&self, height: f32, normal: Vec3) -> [u8; 4] {
        let p = &self.params;
        let above_sea = (height - p.sea_level) / (p.height_scale - p.sea_level).max(1.0);
        if height < p.sea_level {
            return [38, 84, 140, 255];
        }
        if normal.y < 0.75 {
            return [112, 104, 96, 255]; // rock
        }
        match above_sea {
            h if h < 0.05 => [194, 178, 128, 255], // sand
            h if h < 0.6 => [72, 128, 56, 255],    // grass
            h if h < 0.85 => [120, 110, 100, 255], // rock
            _ => [240, 240, 245, 255],             // snow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terrain_params_default() {
        let params = TerrainParams::default();
        assert_eq!(params.seed, 12345);
        assert_eq!(params.scale, 100.0);
        assert_eq!(params.height_scale, 64.0);
        assert_eq!(params.octaves, 4);
    }

    #[test]
    fn test_height_in_range() {
        let generator = TerrainGenerator::new(TerrainParams::default());
        for i in 0..100 {
            let h = generator.height_at(i as f32 * 13.7, i as f32 * -7.3);
            assert!((0.0..=64.0).contains(&h), "height {} out of range", h);
        }
    }

    #[test]
    fn test_terrain_deterministic() {
        let a = TerrainGenerator::new(TerrainParams::default());
        let b = TerrainGenerator::new(TerrainParams::default());
        assert_eq!(a.height_at(123.4, 567.8), b.height_at(123.4, 567.8));

        let other = TerrainGenerator::new(TerrainParams { seed: 7, ..Default::default() });
        let differs = (0..16).any(|i| {
            let x = i as f32 * 31.0 + 0.5;
            a.height_at(x, x) != other.height_at(x, x)
        });
        assert!(differs);
    }

    #[test]
    fn test_normal_points_up() {
        let generator = TerrainGenerator::new(TerrainParams::default());
        let n = generator.normal_at(50.0, 50.0, 0.5);
        assert!(n.y > 0.0);
        assert!((n.length() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_height_bounds_ordered() {
        let generator = TerrainGenerator::new(TerrainParams::default());
        let (min_h, max_h) = generator.height_bounds(0.0, 64.0, 0.0, 64.0);
        assert!(min_h <= max_h);
    }
}
