//! Stage coordinate calibration and measurement-grid generation.
//!
//! Coordinate system, looking downstream:
//! - X: bank to bank, origin at the left bank
//! - Y: water depth, origin at the bed, positive upward
//! - Z: upstream station, chosen per plane by the operator

use log::{error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::RigError;
use crate::flow::{feet_to_steps, steps_to_feet};
use crate::types::SamplingPosition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub x_steps: i32,
    pub y_steps: i32,
    pub label: String,
}

/// Rectangle in feet relative to the grid origin, with its own sampling-time multiplier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiZone {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub density_multiplier: f64,
}

impl RoiZone {
    pub fn contains(&self, x_feet: f64, y_feet: f64) -> bool {
        (self.x_min..=self.x_max).contains(&x_feet) && (self.y_min..=self.y_max).contains(&y_feet)
    }

    pub fn multiplier_is_valid(&self) -> bool {
        self.density_multiplier.is_finite() && self.density_multiplier >= 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridDefinition {
    pub origin_x: i32,
    pub origin_y: i32,
    pub max_x: i32,
    pub max_y: i32,
    pub x_spacing_feet: f64,
    pub y_spacing_feet: f64,
    #[serde(default)]
    pub roi_zones: Vec<RoiZone>,
}

impl GridDefinition {
    pub fn x_spacing_steps(&self) -> i32 {
        feet_to_steps(self.x_spacing_feet)
    }

    pub fn y_spacing_steps(&self) -> i32 {
        feet_to_steps(self.y_spacing_feet)
    }

    fn validate(&self) -> Result<(), RigError> {
        if self.max_x < self.origin_x || self.max_y < self.origin_y {
            return Err(RigError::Calibration(format!(
                "boundary ({}, {}) lies below origin ({}, {})",
                self.max_x, self.max_y, self.origin_x, self.origin_y
            )));
        }
        if self.x_spacing_steps() <= 0 || self.y_spacing_steps() <= 0 {
            return Err(RigError::Calibration(format!(
                "grid spacing must be at least one step (got {} ft x {} ft)",
                self.x_spacing_feet, self.y_spacing_feet
            )));
        }
        if let Some(zone) = self.roi_zones.iter().find(|z| !z.multiplier_is_valid()) {
            return Err(RigError::Calibration(format!(
                "ROI density multiplier must be finite and >= 0 (got {})",
                zone.density_multiplier
            )));
        }
        Ok(())
    }

    /// First ROI zone containing the point, if any
    pub fn zone_at(&self, x_feet: f64, y_feet: f64) -> Option<&RoiZone> {
        self.roi_zones.iter().find(|z| z.contains(x_feet, y_feet))
    }

    /// Every grid point, outer X then inner Y, boundary included on both axes.
    ///
    /// ROI zones never drop points; they only tag them.
    pub fn positions(&self) -> Vec<SamplingPosition> {
        let xs = axis_stops(self.origin_x, self.max_x, self.x_spacing_steps());
        let ys = axis_stops(self.origin_y, self.max_y, self.y_spacing_steps());

        let mut positions = Vec::with_capacity(xs.len() * ys.len());
        for &x in &xs {
            for &y in &ys {
                let x_feet = steps_to_feet(x - self.origin_x);
                let y_feet = steps_to_feet(y - self.origin_y);
                let zone = self.zone_at(x_feet, y_feet);
                positions.push(SamplingPosition {
                    x_steps: x,
                    y_steps: y,
                    x_feet,
                    y_feet,
                    in_roi: zone.is_some(),
                    roi_density_multiplier: zone.map_or(1.0, |z| z.density_multiplier),
                });
            }
        }
        positions
    }
}

/// `start, start + step, ...` below `end`, then `end` itself
fn axis_stops(start: i32, end: i32, step: i32) -> Vec<i32> {
    let mut stops = Vec::new();
    let mut value = start as i64;
    while value < end as i64 {
        stops.push(value as i32);
        value += step.max(1) as i64;
    }
    stops.push(end);
    stops
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPoint {
    pub x_steps: i32,
    pub y_steps: i32,
}

/// Persisted form of a [`CalibrationManager`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSnapshot {
    pub origin: Option<StepPoint>,
    pub boundary: Option<StepPoint>,
    pub grid: Option<GridDefinition>,
    pub home_position: Option<StepPoint>,
}

#[derive(Debug, Default, Clone)]
pub struct CalibrationManager {
    origin: Option<CalibrationPoint>,
    boundary: Option<CalibrationPoint>,
    grid: Option<GridDefinition>,
    home: Option<StepPoint>,
}

impl CalibrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bottom-left corner: left bank at the bed
    pub fn set_origin(&mut self, x_steps: i32, y_steps: i32) {
        self.origin = Some(CalibrationPoint {
            x_steps,
            y_steps,
            label: "origin".to_string(),
        });
        info!("Origin set to X={}, Y={} steps", x_steps, y_steps);
    }

    /// Top-right corner: far bank at the surface
    pub fn set_boundary(&mut self, x_steps: i32, y_steps: i32) {
        self.boundary = Some(CalibrationPoint {
            x_steps,
            y_steps,
            label: "boundary".to_string(),
        });
        info!("Boundary set to X={}, Y={} steps", x_steps, y_steps);
    }

    pub fn origin(&self) -> Option<&CalibrationPoint> {
        self.origin.as_ref()
    }

    pub fn boundary(&self) -> Option<&CalibrationPoint> {
        self.boundary.as_ref()
    }

    pub fn grid(&self) -> Option<&GridDefinition> {
        self.grid.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.origin.is_some() && self.boundary.is_some()
    }

    pub fn generate_grid(
        &mut self,
        x_spacing_feet: f64,
        y_spacing_feet: f64,
        roi_zones: Vec<RoiZone>,
    ) -> Result<&GridDefinition, RigError> {
        let (Some(origin), Some(boundary)) = (&self.origin, &self.boundary) else {
            error!("Origin and boundary must be set before generating grid");
            return Err(RigError::Calibration(
                "origin and boundary must be set before generating a grid".to_string(),
            ));
        };

        let grid = GridDefinition {
            origin_x: origin.x_steps,
            origin_y: origin.y_steps,
            max_x: boundary.x_steps,
            max_y: boundary.y_steps,
            x_spacing_feet,
            y_spacing_feet,
            roi_zones,
        };
        grid.validate()?;

        info!(
            "Grid generated: X steps [{}, {}], Y steps [{}, {}]",
            grid.origin_x, grid.max_x, grid.origin_y, grid.max_y
        );
        Ok(self.grid.insert(grid))
    }

    pub fn grid_positions(&self) -> Result<Vec<SamplingPosition>, RigError> {
        let grid = self
            .grid
            .as_ref()
            .ok_or_else(|| RigError::Calibration("grid not yet generated".to_string()))?;
        let positions = grid.positions();
        info!("Generated {} measurement positions", positions.len());
        Ok(positions)
    }

    /// Set the safe return point. Missing coordinates default to the middle
    /// of the X span at the top of the Y span (mid-channel, at the surface).
    pub fn set_home_position(
        &mut self,
        x_steps: Option<i32>,
        y_steps: Option<i32>,
    ) -> Result<StepPoint, RigError> {
        let home = match (x_steps, y_steps) {
            (Some(x_steps), Some(y_steps)) => StepPoint { x_steps, y_steps },
            _ => {
                let grid = self.grid.as_ref().ok_or_else(|| {
                    RigError::Calibration(
                        "cannot derive home position without a grid".to_string(),
                    )
                })?;
                StepPoint {
                    x_steps: x_steps.unwrap_or(
                        ((grid.origin_x as i64 + grid.max_x as i64).div_euclid(2)) as i32,
                    ),
                    y_steps: y_steps.unwrap_or(grid.max_y),
                }
            }
        };
        info!("Home position set to X={}, Y={} steps", home.x_steps, home.y_steps);
        self.home = Some(home);
        Ok(home)
    }

    pub fn home_position(&self) -> Option<StepPoint> {
        self.home
    }

    pub fn snapshot(&self) -> CalibrationSnapshot {
        let point = |p: &CalibrationPoint| StepPoint {
            x_steps: p.x_steps,
            y_steps: p.y_steps,
        };
        CalibrationSnapshot {
            origin: self.origin.as_ref().map(point),
            boundary: self.boundary.as_ref().map(point),
            grid: self.grid.clone(),
            home_position: self.home,
        }
    }

    pub fn from_snapshot(snapshot: CalibrationSnapshot) -> Self {
        let mut manager = Self::new();
        if let Some(p) = snapshot.origin {
            manager.set_origin(p.x_steps, p.y_steps);
        }
        if let Some(p) = snapshot.boundary {
            manager.set_boundary(p.x_steps, p.y_steps);
        }
        manager.grid = snapshot.grid;
        manager.home = snapshot.home_position;
        manager
    }

    pub fn to_json(&self) -> Result<serde_json::Value, RigError> {
        Ok(serde_json::to_value(self.snapshot())?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, RigError> {
        Ok(Self::from_snapshot(serde_json::from_value(value)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RigError> {
        let text = serde_json::to_string_pretty(&self.snapshot())?;
        fs::write(path.as_ref(), text)?;
        info!("Calibration saved to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RigError> {
        let text = fs::read_to_string(path.as_ref())?;
        let snapshot: CalibrationSnapshot = serde_json::from_str(&text)?;
        info!("Calibration loaded from {}", path.as_ref().display());
        Ok(Self::from_snapshot(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrated(max_x: i32, max_y: i32) -> CalibrationManager {
        let mut cal = CalibrationManager::new();
        cal.set_origin(0, 0);
        cal.set_boundary(max_x, max_y);
        cal
    }

    #[test]
    fn test_grid_requires_both_corners() {
        let mut cal = CalibrationManager::new();
        cal.set_origin(0, 0);
        assert!(matches!(
            cal.generate_grid(0.1, 0.1, vec![]),
            Err(RigError::Calibration(_))
        ));
        assert!(cal.grid_positions().is_err());
    }

    #[test]
    fn test_reference_grid_has_441_points() {
        let mut cal = calibrated(92_000, 92_000);
        cal.generate_grid(0.1, 0.1, vec![]).unwrap();
        let positions = cal.grid_positions().unwrap();

        assert_eq!(positions.len(), 21 * 21);
        assert_eq!((positions[0].x_steps, positions[0].y_steps), (0, 0));
        assert_eq!((positions[1].x_steps, positions[1].y_steps), (0, 4600));
        assert_eq!((positions[21].x_steps, positions[21].y_steps), (4600, 0));
        let last = positions.last().unwrap();
        assert_eq!((last.x_steps, last.y_steps), (92_000, 92_000));
        assert_eq!(last.x_feet, 2.0);
    }

    #[test]
    fn test_uneven_span_includes_boundary() {
        let mut cal = CalibrationManager::new();
        cal.set_origin(1000, 500);
        cal.set_boundary(11_000, 500);
        cal.generate_grid(0.1, 0.05, vec![]).unwrap();
        let positions = cal.grid_positions().unwrap();

        // ceil(10000 / 4600) + 1 = 4 stops on X, a single row on Y
        let xs: Vec<i32> = positions.iter().map(|p| p.x_steps).collect();
        assert_eq!(xs, vec![1000, 5600, 10_200, 11_000]);
        assert!(positions.iter().all(|p| p.y_steps == 500));
    }

    #[test]
    fn test_grid_count_and_bounds_hold_for_varied_spans() {
        for (max_x, max_y, sx, sy) in [
            (10_000, 7_000, 0.05, 0.02),
            (46_000, 0, 0.3, 0.1),
            (123_457, 9_999, 0.11, 0.07),
        ] {
            let mut cal = calibrated(max_x, max_y);
            let grid = cal.generate_grid(sx, sy, vec![]).unwrap().clone();
            let positions = cal.grid_positions().unwrap();

            let nx = (max_x as f64 / grid.x_spacing_steps() as f64).ceil() as usize + 1;
            let ny = (max_y as f64 / grid.y_spacing_steps() as f64).ceil() as usize + 1;
            assert_eq!(positions.len(), nx * ny);
            assert!(positions.iter().all(|p| (0..=max_x).contains(&p.x_steps)
                && (0..=max_y).contains(&p.y_steps)));
        }
    }

    #[test]
    fn test_roi_tags_without_dropping_points() {
        let mut cal = calibrated(92_000, 92_000);
        let zones = vec![
            RoiZone {
                x_min: 0.0,
                x_max: 0.5,
                y_min: 0.0,
                y_max: 0.2,
                density_multiplier: 2.0,
            },
            RoiZone {
                x_min: 0.0,
                x_max: 2.0,
                y_min: 0.0,
                y_max: 2.0,
                density_multiplier: 3.0,
            },
        ];
        cal.generate_grid(0.1, 0.1, zones).unwrap();
        let positions = cal.grid_positions().unwrap();

        assert_eq!(positions.len(), 441);
        let near_bed = positions.iter().find(|p| p.x_steps == 0 && p.y_steps == 4600).unwrap();
        assert!(near_bed.in_roi);
        assert_eq!(near_bed.roi_density_multiplier, 2.0);
        let far = positions.last().unwrap();
        assert_eq!(far.roi_density_multiplier, 3.0);
    }

    #[test]
    fn test_invalid_grids_are_rejected() {
        let mut cal = calibrated(-10, 100);
        assert!(cal.generate_grid(0.1, 0.1, vec![]).is_err());

        let mut cal = calibrated(100, 100);
        assert!(cal.generate_grid(0.0, 0.1, vec![]).is_err());
        assert!(cal.grid().is_none());

        for multiplier in [-1.0, f64::NAN, f64::INFINITY] {
            let zone = RoiZone {
                x_min: 0.0,
                x_max: 1.0,
                y_min: 0.0,
                y_max: 1.0,
                density_multiplier: multiplier,
            };
            assert!(matches!(
                cal.generate_grid(0.1, 0.1, vec![zone]),
                Err(RigError::Calibration(_))
            ));
        }
    }

    #[test]
    fn test_home_defaults_to_mid_span_surface() {
        let mut cal = calibrated(92_001, 40_000);
        assert!(cal.set_home_position(None, None).is_err());

        cal.generate_grid(0.1, 0.1, vec![]).unwrap();
        let home = cal.set_home_position(None, None).unwrap();
        assert_eq!(home, StepPoint { x_steps: 46_000, y_steps: 40_000 });

        let manual = cal.set_home_position(Some(5), Some(6)).unwrap();
        assert_eq!(cal.home_position(), Some(manual));

        let partial = cal.set_home_position(Some(100), None).unwrap();
        assert_eq!(partial, StepPoint { x_steps: 100, y_steps: 40_000 });
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut cal = calibrated(92_000, 46_000);
        cal.generate_grid(
            0.1,
            0.05,
            vec![RoiZone {
                x_min: 0.5,
                x_max: 1.0,
                y_min: 0.0,
                y_max: 0.25,
                density_multiplier: 1.5,
            }],
        )
        .unwrap();
        cal.set_home_position(None, None).unwrap();

        let restored = CalibrationManager::from_json(cal.to_json().unwrap()).unwrap();
        assert_eq!(restored.snapshot(), cal.snapshot());
        assert_eq!(restored.origin(), cal.origin());
        assert_eq!(restored.grid_positions().unwrap(), cal.grid_positions().unwrap());
    }
}
