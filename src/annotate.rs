//! Overlay of detections and zones for the processed video feed.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::model::{FrameAnalysis, VehicleType};
use crate::zones::Polygon;

const ZONE_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

fn color_for(vehicle_type: VehicleType) -> Rgb<u8> {
    match vehicle_type {
        VehicleType::Car => Rgb([0, 200, 0]),
        VehicleType::Bus => Rgb([255, 140, 0]),
        VehicleType::Truck => Rgb([220, 0, 0]),
        VehicleType::Motorcycle => Rgb([0, 120, 255]),
    }
}

/// Draw zone outlines and vehicle boxes onto a copy of `raw`.
pub fn annotate(raw: &RgbImage, analysis: &FrameAnalysis, zones: &[(String, Polygon)]) -> RgbImage {
    let mut out = raw.clone();
    for (_, polygon) in zones {
        let points = polygon.points();
        for (i, start) in points.iter().enumerate() {
            let end = points[(i + 1) % points.len()];
            draw_line_segment_mut(&mut out, (start[0], start[1]), (end[0], end[1]), ZONE_COLOR);
        }
    }

    let (width, height) = out.dimensions();
    for vehicle in &analysis.vehicles {
        let x1 = vehicle.bbox.x1.max(0.0).min(width as f32 - 1.0);
        let y1 = vehicle.bbox.y1.max(0.0).min(height as f32 - 1.0);
        let w = (vehicle.bbox.x2.min(width as f32) - x1).max(1.0) as u32;
        let h = (vehicle.bbox.y2.min(height as f32) - y1).max(1.0) as u32;
        let color = color_for(vehicle.vehicle_type);
        draw_hollow_rect_mut(&mut out, Rect::at(x1 as i32, y1 as i32).of_size(w, h), color);
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(
                &mut out,
                Rect::at(x1 as i32 + 1, y1 as i32 + 1).of_size(w - 2, h - 2),
                color,
            );
        }
    }
    out
}
