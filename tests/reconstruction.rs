//! End to end reconstruction of synthetic stereo pairs

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

mod common;

use approx::assert_relative_eq;
use image::{Rgb, RgbImage};

use stereo_depth::config::CameraParams;
use stereo_depth::depth::depth_from_disparity;
use stereo_depth::geometry::GeometryEstimator;
use stereo_depth::prelude::*;

use common::{
    camera, init_logging, layered_pair, params, shifted_pair, HEIGHT, LAYERED_WIDTH, SHIFT, WIDTH
};

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[test]
fn recovers_known_disparity_and_depth() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let (left, right) = shifted_pair(11);
    let pipeline = StereoPipeline::new(camera(), params())?;
    let result = pipeline.reconstruct(&left, &right)?;

    assert_eq!(result.alignment, Alignment::Raw);
    assert!(result.warnings.is_empty());

    let expected_depth = pipeline.focal_pixels() * camera().baseline / SHIFT as f64;

    let mut disparities = Vec::new();
    let mut close_depths = 0;
    for y in 6..(HEIGHT as usize - 6) {
        for x in 24..(WIDTH as usize - 12) {
            if let Some(d) = result.disparity.get(x, y) {
                disparities.push(d);
            }
            if let Some(z) = result.depth.get(x, y) {
                if ((z as f64 - expected_depth) / expected_depth).abs() < 0.1 {
                    close_depths += 1;
                }
            }
        }
    }

    let patch = (HEIGHT as usize - 12) * (WIDTH as usize - 36);
    assert!(disparities.len() as f64 > 0.9 * patch as f64);
    assert!(close_depths as f64 > 0.9 * patch as f64);

    disparities.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = disparities[disparities.len() / 2];
    assert!((median - SHIFT as f32).abs() < 0.5, "median disparity {}", median);

    Ok(())
}

#[test]
fn depth_follows_disparity_everywhere() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let (left, right) = shifted_pair(12);
    let pipeline = StereoPipeline::new(camera(), params())?;
    let result = pipeline.reconstruct(&left, &right)?;

    for y in 0..result.depth.height() {
        for x in 0..result.depth.width() {
            match result.disparity.get(x, y) {
                Some(d) => assert_eq!(
                    result.depth.depth_at(x, y),
                    depth_from_disparity(d, pipeline.focal_pixels(), camera().baseline)
                ),
                None => assert_eq!(result.depth.depth_at(x, y), 0.0)
            }
        }
    }

    Ok(())
}

#[test]
fn reconstruction_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let (left, right) = shifted_pair(13);
    let pipeline = StereoPipeline::new(camera(), params())?;

    let first = pipeline.reconstruct(&left, &right)?;
    let second = pipeline.reconstruct(&left, &right)?;

    assert_eq!(first.disparity, second.disparity);
    assert_eq!(first.depth, second.depth);
    assert_eq!(first.cloud, second.cloud);

    Ok(())
}

#[test]
fn cloud_points_project_back_to_their_pixels() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let (left, right) = shifted_pair(14);
    let pipeline = StereoPipeline::new(camera(), params())?;
    let result = pipeline.reconstruct(&left, &right)?;
    let f = pipeline.focal_pixels() as f32;
    let far = pipeline.params().far_plane as f32;

    assert!(!result.cloud.is_empty());

    let in_range = result
        .depth
        .as_image()
        .as_slice()
        .iter()
        .filter(|&&z| z > 0.0 && z < far)
        .count();
    assert!(result.cloud.len() <= in_range);

    for p in result.cloud.iter() {
        let z = p.position.z;
        assert!(z > 0.0 && z < far);

        let i = p.position.x * f / z + WIDTH as f32 / 2.0;
        let j = p.position.y * f / z + HEIGHT as f32 / 2.0;
        assert_relative_eq!(i, p.pixel.0 as f32, epsilon = 1e-2);
        assert_relative_eq!(j, p.pixel.1 as f32, epsilon = 1e-2);

        assert_eq!(p.color, *left.get_pixel(p.pixel.0, p.pixel.1));
    }

    Ok(())
}

#[test]
fn textured_pair_is_rectified_onto_shared_rows() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let (left, right) = layered_pair(21);
    let camera = CameraParams {
        target_width: LAYERED_WIDTH,
        ..camera()
    };
    let mut params = params();
    params.skip_rectification = false;

    let pipeline = StereoPipeline::new(camera, params.clone())?;
    let (frame, warning) = pipeline.rectify_images(&left, &right)?;

    assert!(warning.is_none(), "unexpected fallback: {:?}", warning);
    let homographies = match &frame.alignment {
        Alignment::Rectified(pair) => *pair,
        Alignment::Raw => panic!("pair was not rectified")
    };
    assert!(homographies.left.iter().chain(homographies.right.iter()).all(|v| v.is_finite()));
    assert_eq!(frame.guide.dimensions(), left.dimensions());

    // The same seeded estimate the pipeline made
    let estimator = GeometryEstimator::new(params.features.clone(), params.geometry.clone());
    let geometry = estimator.estimate(
        &image::imageops::grayscale(&left),
        &image::imageops::grayscale(&right)
    )?;
    let inliers = geometry.inlier_points();
    assert!(inliers.len() >= params.geometry.min_matches);

    let mut row_errors = Vec::new();
    for (l, r) in &inliers {
        let l = homographies.map_left(l).ok_or("left inlier maps to infinity")?;
        let r = homographies.map_right(r).ok_or("right inlier maps to infinity")?;
        row_errors.push((l.y - r.y).abs());
    }
    row_errors.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let median = row_errors[row_errors.len() / 2];
    let worst = row_errors[row_errors.len() - 1];
    assert!(median < 1.0, "median row error {}", median);
    assert!(worst < 2.0 * params.geometry.ransac_threshold, "worst row error {}", worst);

    Ok(())
}

#[test]
fn far_plane_excluding_everything_warns() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let (left, right) = shifted_pair(15);
    let mut params = params();
    params.far_plane = 1.0;

    let pipeline = StereoPipeline::new(camera(), params)?;
    let result = pipeline.reconstruct(&left, &right)?;

    assert!(result.cloud.is_empty());
    assert!(result.depth.valid_count() > 0);
    assert!(matches!(result.warnings.as_slice(), [Error::NoValidDepth]));

    Ok(())
}

#[test]
fn featureless_pair_falls_back_to_raw_images() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let img = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([120, 120, 120]));
    let mut params = params();
    params.skip_rectification = false;

    let pipeline = StereoPipeline::new(camera(), params)?;
    let result = pipeline.reconstruct(&img, &img)?;

    assert_eq!(result.alignment, Alignment::Raw);
    assert!(matches!(
        result.warnings.first(),
        Some(Error::InsufficientCorrespondence { required: 10, .. })
    ));
    assert!(result.warnings.iter().all(|w| w.is_recoverable()));

    Ok(())
}

#[test]
fn mismatched_pair_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = StereoPipeline::new(camera(), params())?;
    let left = RgbImage::new(WIDTH, HEIGHT);
    let right = RgbImage::new(WIDTH, HEIGHT + 2);

    assert!(matches!(
        pipeline.reconstruct(&left, &right),
        Err(Error::ImageDimensionMismatch { .. })
    ));

    Ok(())
}

#[test]
fn ply_export_has_one_line_per_point() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let (left, right) = shifted_pair(16);
    let pipeline = StereoPipeline::new(camera(), params())?;
    let result = pipeline.reconstruct(&left, &right)?;

    let mut out = Vec::new();
    result.cloud.write_ply(&mut out)?;
    let text = String::from_utf8(out)?;
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(lines[2], format!("element vertex {}", result.cloud.len()));
    assert_eq!(lines[9], "end_header");
    assert_eq!(lines.len(), 10 + result.cloud.len());

    for line in &lines[10..] {
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields.len(), 6);
        assert!(fields[..3].iter().all(|f| f.split('.').nth(1).map(str::len) == Some(2)));
        assert!(fields[3..].iter().all(|f| f.parse::<u8>().is_ok()));
    }

    Ok(())
}
