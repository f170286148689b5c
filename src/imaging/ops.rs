//! Operation vocabulary and the spec-string compiler.
//!
//! A rule's operation list comes out of the config as plain strings like
//! `"crop 10% 20% 100% 100%"` or `"scale_in 300 300 false"`. Compilation
//! turns each string into a typed [`Op`] and validates the operation name
//! and operand count up front, so a misconfigured rule fails at load time
//! rather than halfway through a build. Operands stay symbolic inside the
//! compiled op (see [`super::operand`]) and are resolved against the
//! current image dimensions when the op is applied.
//!
//! Embedding callers can splice arbitrary transformations into a sequence
//! through [`CustomOp`]; config files can only express the fixed
//! vocabulary.

use super::operand::{InvalidOperand, Operand, ScaleTarget};
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while compiling operation spec strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    #[error("`{op}` takes {expected} operand(s), got {found}")]
    ArityMismatch {
        op: &'static str,
        expected: &'static str,
        found: usize,
    },

    #[error(transparent)]
    InvalidOperand(#[from] InvalidOperand),
}

/// Error raised while applying an operation to an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The resolved crop region has zero (or negative) area.
    #[error("crop region is empty ({width}x{height})")]
    DegenerateCrop { width: i64, height: i64 },
}

/// An arbitrary image transformation supplied through the library API.
pub trait CustomOp: Send + Sync {
    fn apply(&self, image: DynamicImage) -> DynamicImage;
}

/// Shared handle to a [`CustomOp`]; cloning is cheap so compiled
/// sequences can be reused across derivation requests.
#[derive(Clone)]
pub struct CustomRef(pub Arc<dyn CustomOp>);

impl fmt::Debug for CustomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomRef(..)")
    }
}

/// One entry of a rule's operation list: a textual spec from the config,
/// or a custom transformation registered programmatically.
#[derive(Debug, Clone)]
pub enum OpSpec {
    Text(String),
    Custom(CustomRef),
}

impl From<&str> for OpSpec {
    fn from(s: &str) -> Self {
        OpSpec::Text(s.to_string())
    }
}

impl From<String> for OpSpec {
    fn from(s: String) -> Self {
        OpSpec::Text(s)
    }
}

/// The fixed convolution/filter vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Blur,
    Contour,
    Detail,
    EdgeEnhance,
    EdgeEnhanceMore,
    Emboss,
    FindEdges,
    Sharpen,
    Smooth,
    SmoothMore,
}

impl FilterKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "blur" => FilterKind::Blur,
            "contour" => FilterKind::Contour,
            "detail" => FilterKind::Detail,
            "edge_enhance" => FilterKind::EdgeEnhance,
            "edge_enhance_more" => FilterKind::EdgeEnhanceMore,
            "emboss" => FilterKind::Emboss,
            "find_edges" => FilterKind::FindEdges,
            "sharpen" => FilterKind::Sharpen,
            "smooth" => FilterKind::Smooth,
            "smooth_more" => FilterKind::SmoothMore,
            _ => return None,
        })
    }
}

// 3x3 convolution kernels, pre-divided by their weight sums.
const KERNEL_CONTOUR: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 9.0, -1.0, -1.0, -1.0, -1.0];
const KERNEL_DETAIL: [f32; 9] = [
    0.0,
    -1.0 / 6.0,
    0.0,
    -1.0 / 6.0,
    10.0 / 6.0,
    -1.0 / 6.0,
    0.0,
    -1.0 / 6.0,
    0.0,
];
const KERNEL_EDGE_ENHANCE: [f32; 9] = [
    -0.5, -0.5, -0.5, //
    -0.5, 5.0, -0.5, //
    -0.5, -0.5, -0.5,
];
const KERNEL_EDGE_ENHANCE_MORE: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 9.0, -1.0, -1.0, -1.0, -1.0];
const KERNEL_EMBOSS: [f32; 9] = [-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
const KERNEL_FIND_EDGES: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 8.0, -1.0, -1.0, -1.0, -1.0];
const KERNEL_SHARPEN: [f32; 9] = [
    -2.0 / 16.0,
    -2.0 / 16.0,
    -2.0 / 16.0,
    -2.0 / 16.0,
    32.0 / 16.0,
    -2.0 / 16.0,
    -2.0 / 16.0,
    -2.0 / 16.0,
    -2.0 / 16.0,
];
const KERNEL_SMOOTH: [f32; 9] = [
    1.0 / 13.0,
    1.0 / 13.0,
    1.0 / 13.0,
    1.0 / 13.0,
    5.0 / 13.0,
    1.0 / 13.0,
    1.0 / 13.0,
    1.0 / 13.0,
    1.0 / 13.0,
];

/// A single compiled image operation.
#[derive(Debug, Clone)]
pub enum Op {
    Crop {
        left: Operand,
        top: Operand,
        right: Operand,
        bottom: Operand,
    },
    /// Exact resize, aspect ratio not preserved.
    Resize { width: Operand, height: Operand },
    /// Largest aspect-preserving fit *inside* the box.
    ScaleIn {
        width: ScaleTarget,
        height: ScaleTarget,
        upscale: bool,
    },
    /// Smallest aspect-preserving cover *of* the box.
    ScaleOut {
        width: ScaleTarget,
        height: ScaleTarget,
        upscale: bool,
    },
    /// Counter-clockwise rotation, canvas expanded to fit.
    Rotate { degrees: f64 },
    FlipHorizontal,
    FlipVertical,
    Grayscale,
    Filter(FilterKind),
    Custom(CustomRef),
}

/// Compile a list of operation specs into an executable sequence.
pub fn compile(specs: &[OpSpec]) -> Result<Vec<Op>, CompileError> {
    specs
        .iter()
        .map(|spec| match spec {
            OpSpec::Text(s) => compile_one(s),
            OpSpec::Custom(c) => Ok(Op::Custom(c.clone())),
        })
        .collect()
}

/// Compile a single whitespace-separated spec string.
pub fn compile_one(spec: &str) -> Result<Op, CompileError> {
    let mut tokens = spec.split_whitespace();
    let name = tokens
        .next()
        .ok_or_else(|| CompileError::UnknownOperation(String::new()))?;
    let args: Vec<&str> = tokens.collect();

    match name {
        "crop" => {
            let [left, top, right, bottom] = expect_args("crop", "4", &args)?;
            Ok(Op::Crop {
                left: Operand::parse(left)?,
                top: Operand::parse(top)?,
                right: Operand::parse(right)?,
                bottom: Operand::parse(bottom)?,
            })
        }
        "resize" => {
            let [width, height] = expect_args("resize", "2", &args)?;
            Ok(Op::Resize {
                width: Operand::parse(width)?,
                height: Operand::parse(height)?,
            })
        }
        "scale_in" => compile_scale("scale_in", &args, true),
        "scale_out" => compile_scale("scale_out", &args, false),
        "rotate" => {
            let [deg] = expect_args("rotate", "1", &args)?;
            let degrees = deg
                .parse::<f64>()
                .map_err(|_| InvalidOperand(deg.to_string()))?;
            Ok(Op::Rotate { degrees })
        }
        "flip_horizontal" => zero_arity("flip_horizontal", &args, Op::FlipHorizontal),
        "flip_vertical" => zero_arity("flip_vertical", &args, Op::FlipVertical),
        "grayscale" => zero_arity("grayscale", &args, Op::Grayscale),
        other => match FilterKind::from_name(other) {
            // Filter names double as zero-arity operations.
            Some(kind) => {
                if args.is_empty() {
                    Ok(Op::Filter(kind))
                } else {
                    Err(arity(other_static(kind), "0", args.len()))
                }
            }
            None => Err(CompileError::UnknownOperation(other.to_string())),
        },
    }
}

fn compile_scale(op: &'static str, args: &[&str], inside: bool) -> Result<Op, CompileError> {
    if args.len() < 2 || args.len() > 3 {
        return Err(arity(op, "2 or 3", args.len()));
    }
    let width = ScaleTarget::parse(args[0])?;
    let height = ScaleTarget::parse(args[1])?;
    let upscale = match args.get(2) {
        None => true,
        Some(&"true") | Some(&"1") => true,
        Some(&"false") | Some(&"0") => false,
        Some(other) => return Err(InvalidOperand(other.to_string()).into()),
    };
    Ok(if inside {
        Op::ScaleIn {
            width,
            height,
            upscale,
        }
    } else {
        Op::ScaleOut {
            width,
            height,
            upscale,
        }
    })
}

fn expect_args<'a, const N: usize>(
    op: &'static str,
    expected: &'static str,
    args: &[&'a str],
) -> Result<[&'a str; N], CompileError> {
    <[&str; N]>::try_from(args).map_err(|_| arity(op, expected, args.len()))
}

fn zero_arity(op: &'static str, args: &[&str], result: Op) -> Result<Op, CompileError> {
    if args.is_empty() {
        Ok(result)
    } else {
        Err(arity(op, "0", args.len()))
    }
}

fn arity(op: &'static str, expected: &'static str, found: usize) -> CompileError {
    CompileError::ArityMismatch {
        op,
        expected,
        found,
    }
}

fn other_static(kind: FilterKind) -> &'static str {
    match kind {
        FilterKind::Blur => "blur",
        FilterKind::Contour => "contour",
        FilterKind::Detail => "detail",
        FilterKind::EdgeEnhance => "edge_enhance",
        FilterKind::EdgeEnhanceMore => "edge_enhance_more",
        FilterKind::Emboss => "emboss",
        FilterKind::FindEdges => "find_edges",
        FilterKind::Sharpen => "sharpen",
        FilterKind::Smooth => "smooth",
        FilterKind::SmoothMore => "smooth_more",
    }
}

/// Apply a compiled sequence in order.
pub fn apply_sequence(mut img: DynamicImage, ops: &[Op]) -> Result<DynamicImage, ApplyError> {
    for op in ops {
        img = apply(op, img)?;
    }
    Ok(img)
}

/// Apply one operation, resolving its operands against the image's
/// current dimensions.
pub fn apply(op: &Op, img: DynamicImage) -> Result<DynamicImage, ApplyError> {
    let (w, h) = (img.width(), img.height());
    Ok(match op {
        Op::Crop {
            left,
            top,
            right,
            bottom,
        } => {
            let left = left.resolve(w).clamp(0, w as i64);
            let top = top.resolve(h).clamp(0, h as i64);
            let right = right.resolve(w).clamp(0, w as i64);
            let bottom = bottom.resolve(h).clamp(0, h as i64);
            let (cw, ch) = (right - left, bottom - top);
            if cw <= 0 || ch <= 0 {
                return Err(ApplyError::DegenerateCrop {
                    width: cw,
                    height: ch,
                });
            }
            img.crop_imm(left as u32, top as u32, cw as u32, ch as u32)
        }
        Op::Resize { width, height } => {
            let tw = width.resolve(w).max(1) as u32;
            let th = height.resolve(h).max(1) as u32;
            img.resize_exact(tw, th, FilterType::Lanczos3)
        }
        Op::ScaleIn {
            width,
            height,
            upscale,
        } => scale(img, *width, *height, *upscale, true),
        Op::ScaleOut {
            width,
            height,
            upscale,
        } => scale(img, *width, *height, *upscale, false),
        Op::Rotate { degrees } => rotate(img, *degrees),
        Op::FlipHorizontal => img.fliph(),
        Op::FlipVertical => img.flipv(),
        Op::Grayscale => img.grayscale(),
        Op::Filter(kind) => filter(img, *kind),
        Op::Custom(custom) => custom.0.apply(img),
    })
}

/// Aspect-preserving scale. `inside` picks the limiting axis (fit within
/// the box); otherwise the covering axis wins (fill the box).
fn scale(
    img: DynamicImage,
    width: ScaleTarget,
    height: ScaleTarget,
    upscale: bool,
    inside: bool,
) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    let rw = width.ratio(w);
    let rh = height.ratio(h);
    let mut ratio = if inside { rw.min(rh) } else { rw.max(rh) };
    if !upscale {
        ratio = ratio.min(1.0);
    }
    if (ratio - 1.0).abs() < f64::EPSILON {
        return img;
    }
    let tw = ((w as f64 * ratio).round() as u32).max(1);
    let th = ((h as f64 * ratio).round() as u32).max(1);
    img.resize_exact(tw, th, FilterType::Lanczos3)
}

fn filter(img: DynamicImage, kind: FilterKind) -> DynamicImage {
    match kind {
        FilterKind::Blur => img.blur(2.0),
        FilterKind::Contour => img.filter3x3(&KERNEL_CONTOUR).grayscale(),
        FilterKind::Detail => img.filter3x3(&KERNEL_DETAIL),
        FilterKind::EdgeEnhance => img.filter3x3(&KERNEL_EDGE_ENHANCE),
        FilterKind::EdgeEnhanceMore => img.filter3x3(&KERNEL_EDGE_ENHANCE_MORE),
        FilterKind::Emboss => img.filter3x3(&KERNEL_EMBOSS),
        FilterKind::FindEdges => img.filter3x3(&KERNEL_FIND_EDGES).grayscale(),
        FilterKind::Sharpen => img.filter3x3(&KERNEL_SHARPEN),
        FilterKind::Smooth => img.filter3x3(&KERNEL_SMOOTH),
        FilterKind::SmoothMore => img.blur(1.0),
    }
}

/// Rotate counter-clockwise. Right-angle rotations are lossless; other
/// angles use an inverse-mapped nearest-neighbor resample with the
/// canvas expanded to the rotated bounding box (uncovered corners are
/// transparent).
fn rotate(img: DynamicImage, degrees: f64) -> DynamicImage {
    let normalized = degrees.rem_euclid(360.0);
    if normalized == 0.0 {
        return img;
    }
    if normalized == 90.0 {
        return img.rotate270();
    }
    if normalized == 180.0 {
        return img.rotate180();
    }
    if normalized == 270.0 {
        return img.rotate90();
    }

    let rad = normalized.to_radians();
    let (sin, cos) = rad.sin_cos();
    let (w, h) = (img.width() as f64, img.height() as f64);
    let out_w = ((w * cos.abs() + h * sin.abs()).ceil() as u32).max(1);
    let out_h = ((w * sin.abs() + h * cos.abs()).ceil() as u32).max(1);

    let src = img.to_rgba8();
    let mut out = RgbaImage::new(out_w, out_h);
    let (cx, cy) = (w / 2.0, h / 2.0);
    let (ocx, ocy) = (out_w as f64 / 2.0, out_h as f64 / 2.0);

    for y in 0..out_h {
        for x in 0..out_w {
            // Map the output pixel center back into source space by
            // rotating the opposite way around the centers.
            let dx = x as f64 + 0.5 - ocx;
            let dy = y as f64 + 0.5 - ocy;
            let sx = dx * cos - dy * sin + cx;
            let sy = dx * sin + dy * cos + cy;
            if sx >= 0.0 && sx < w && sy >= 0.0 && sy < h {
                out.put_pixel(x, y, *src.get_pixel(sx as u32, sy as u32));
            }
        }
    }
    DynamicImage::ImageRgba8(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_fn(w, h, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgb([255, 255, 255])
            } else {
                image::Rgb([0, 0, 0])
            }
        }))
    }

    // =========================================================================
    // Compilation
    // =========================================================================

    #[test]
    fn compile_crop() {
        match compile_one("crop 10 20 100 200").unwrap() {
            Op::Crop {
                left,
                top,
                right,
                bottom,
            } => {
                assert_eq!(left, Operand::Absolute(10.0));
                assert_eq!(top, Operand::Absolute(20.0));
                assert_eq!(right, Operand::Absolute(100.0));
                assert_eq!(bottom, Operand::Absolute(200.0));
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn compile_crop_wrong_arity() {
        assert!(matches!(
            compile_one("crop 10 20 100"),
            Err(CompileError::ArityMismatch {
                op: "crop",
                found: 3,
                ..
            })
        ));
    }

    #[test]
    fn compile_scale_in_default_upscale() {
        match compile_one("scale_in 300 300").unwrap() {
            Op::ScaleIn { upscale, .. } => assert!(upscale),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn compile_scale_out_explicit_no_upscale() {
        match compile_one("scale_out 300 none false").unwrap() {
            Op::ScaleOut {
                width,
                height,
                upscale,
            } => {
                assert_eq!(width, ScaleTarget::Bounded(Operand::Absolute(300.0)));
                assert_eq!(height, ScaleTarget::Unbounded);
                assert!(!upscale);
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn compile_scale_bad_upscale_token() {
        assert!(matches!(
            compile_one("scale_in 300 300 maybe"),
            Err(CompileError::InvalidOperand(_))
        ));
    }

    #[test]
    fn compile_rotate() {
        match compile_one("rotate 90").unwrap() {
            Op::Rotate { degrees } => assert_eq!(degrees, 90.0),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn compile_unknown_operation() {
        assert!(matches!(
            compile_one("pixelate 4"),
            Err(CompileError::UnknownOperation(name)) if name == "pixelate"
        ));
    }

    #[test]
    fn compile_filter_rejects_operands() {
        assert!(matches!(
            compile_one("blur 3"),
            Err(CompileError::ArityMismatch { op: "blur", .. })
        ));
    }

    #[test]
    fn compile_all_filters() {
        for name in [
            "blur",
            "contour",
            "detail",
            "edge_enhance",
            "edge_enhance_more",
            "emboss",
            "find_edges",
            "sharpen",
            "smooth",
            "smooth_more",
        ] {
            assert!(
                matches!(compile_one(name), Ok(Op::Filter(_))),
                "{name} should compile to a filter"
            );
        }
    }

    #[test]
    fn compile_whole_sequence() {
        let ops = compile(&[
            OpSpec::from("crop 0 0 50% 50%"),
            OpSpec::from("grayscale"),
            OpSpec::from("resize 100 100"),
        ])
        .unwrap();
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn compile_sequence_reports_first_error() {
        let err = compile(&[OpSpec::from("grayscale"), OpSpec::from("warp 2")]).unwrap_err();
        assert_eq!(err, CompileError::UnknownOperation("warp".to_string()));
    }

    // =========================================================================
    // Application
    // =========================================================================

    #[test]
    fn crop_percent_operands_resolve_against_current_size() {
        let img = checkerboard(400, 200);
        let op = compile_one("crop 25% 25% 75% 75%").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (200, 100));
    }

    #[test]
    fn crop_zero_area_is_degenerate() {
        let img = checkerboard(100, 100);
        let op = compile_one("crop 0 0 0 0").unwrap();
        assert!(matches!(
            apply(&op, img),
            Err(ApplyError::DegenerateCrop { .. })
        ));
    }

    #[test]
    fn crop_inverted_box_is_degenerate() {
        let img = checkerboard(100, 100);
        let op = compile_one("crop 80 0 20 100").unwrap();
        assert!(matches!(
            apply(&op, img),
            Err(ApplyError::DegenerateCrop { .. })
        ));
    }

    #[test]
    fn crop_clamps_out_of_bounds_operands() {
        let img = checkerboard(100, 100);
        let op = compile_one("crop 50 50 500 500").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (50, 50));
    }

    #[test]
    fn resize_ignores_aspect_ratio() {
        let img = checkerboard(400, 200);
        let op = compile_one("resize 100 100").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (100, 100));
    }

    #[test]
    fn scale_in_limits_to_box() {
        let img = checkerboard(600, 400);
        let op = compile_one("scale_in 300 300").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (300, 200));
    }

    #[test]
    fn scale_in_never_upscales_when_disabled() {
        let img = checkerboard(100, 100);
        let op = compile_one("scale_in 300 300 false").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (100, 100));
    }

    #[test]
    fn scale_in_upscales_by_default() {
        let img = checkerboard(100, 100);
        let op = compile_one("scale_in 300 300").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (300, 300));
    }

    #[test]
    fn scale_out_covers_box() {
        let img = checkerboard(600, 400);
        let op = compile_one("scale_out 300 300").unwrap();
        let out = apply(&op, img).unwrap();
        // Height is the covering axis: 300/400 < 300/600.
        assert_eq!((out.width(), out.height()), (450, 300));
    }

    #[test]
    fn scale_with_unbounded_axis() {
        let img = checkerboard(600, 400);
        let op = compile_one("scale_in 300 none").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (300, 200));
    }

    #[test]
    fn scale_percent_operands() {
        let img = checkerboard(600, 400);
        let op = compile_one("scale_in 50% 50%").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (300, 200));
    }

    #[test]
    fn rotate_right_angle_swaps_dimensions() {
        let img = checkerboard(100, 50);
        let op = compile_one("rotate 90").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (50, 100));
    }

    #[test]
    fn rotate_180_keeps_dimensions() {
        let img = checkerboard(100, 50);
        let op = compile_one("rotate 180").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (100, 50));
    }

    #[test]
    fn rotate_arbitrary_angle_expands_canvas() {
        let img = checkerboard(100, 100);
        let op = compile_one("rotate 45").unwrap();
        let out = apply(&op, img).unwrap();
        assert!(out.width() > 100);
        assert!(out.height() > 100);
    }

    #[test]
    fn rotate_negative_angle_normalizes() {
        let img = checkerboard(100, 50);
        let op = compile_one("rotate -270").unwrap();
        let out = apply(&op, img).unwrap();
        assert_eq!((out.width(), out.height()), (50, 100));
    }

    #[test]
    fn flips_keep_dimensions() {
        let img = checkerboard(80, 60);
        for spec in ["flip_horizontal", "flip_vertical"] {
            let out = apply(&compile_one(spec).unwrap(), img.clone()).unwrap();
            assert_eq!((out.width(), out.height()), (80, 60));
        }
    }

    #[test]
    fn grayscale_produces_luma() {
        let img = checkerboard(10, 10);
        let out = apply(&compile_one("grayscale").unwrap(), img).unwrap();
        assert_eq!(out.color().channel_count(), 1);
    }

    #[test]
    fn filters_keep_dimensions() {
        let img = checkerboard(32, 32);
        for spec in ["blur", "sharpen", "emboss", "smooth", "detail"] {
            let out = apply(&compile_one(spec).unwrap(), img.clone()).unwrap();
            assert_eq!((out.width(), out.height()), (32, 32), "{spec}");
        }
    }

    #[test]
    fn custom_op_runs_in_sequence() {
        struct Halve;
        impl CustomOp for Halve {
            fn apply(&self, image: DynamicImage) -> DynamicImage {
                let (w, h) = (image.width() / 2, image.height() / 2);
                image.resize_exact(w.max(1), h.max(1), FilterType::Nearest)
            }
        }

        let ops = compile(&[
            OpSpec::Custom(CustomRef(Arc::new(Halve))),
            OpSpec::from("resize 50% 50%"),
        ])
        .unwrap();
        let out = apply_sequence(checkerboard(400, 400), &ops).unwrap();
        assert_eq!((out.width(), out.height()), (100, 100));
    }

    #[test]
    fn sequence_stops_on_degenerate_crop() {
        let ops = compile(&[OpSpec::from("crop 0 0 0 0"), OpSpec::from("grayscale")]).unwrap();
        assert!(apply_sequence(checkerboard(10, 10), &ops).is_err());
    }
}
