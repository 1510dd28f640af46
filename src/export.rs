//! Export of the selected frames as a sprite sheet, animated GIF, loose
//! frame files or a Godot `SpriteFrames` resource.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Command;

use clap::ValueEnum;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, GenericImage, ImageFormat, Rgb, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SpriteCullError};
use crate::imageops::padding::offset_for;
use crate::imageops::{composite_over, resize_dynamic, Position, ResampleFilter};
use crate::video::spawn_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    SpriteSheet,
    Gif,
    Frames,
    Godot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    #[default]
    Grid,
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpriteSheetConfig {
    pub layout: LayoutMode,
    /// Grid only; `None` uses `ceil(sqrt(n))`.
    pub columns: Option<u32>,
    pub padding: u32,
    pub frame_size: Option<(u32, u32)>,
    pub background: Rgba<u8>,
    pub generate_json: bool,
    pub filter: ResampleFilter,
    /// Placement of frames smaller than the cell.
    pub anchor: Position,
}

impl Default for SpriteSheetConfig {
    fn default() -> Self {
        Self {
            layout: LayoutMode::Grid,
            columns: None,
            padding: 0,
            frame_size: None,
            background: Rgba([0, 0, 0, 0]),
            generate_json: true,
            filter: ResampleFilter::Lanczos,
            anchor: Position::Bottom,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GifConfig {
    pub fps: f32,
    /// 0 repeats forever.
    pub loop_count: u16,
    /// Slowest, best palette quantisation when set.
    pub optimize: bool,
    pub frame_size: Option<(u32, u32)>,
    pub filter: ResampleFilter,
}

impl Default for GifConfig {
    fn default() -> Self {
        Self {
            fps: 10.0,
            loop_count: 0,
            optimize: true,
            frame_size: None,
            filter: ResampleFilter::Lanczos,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GodotConfig {
    pub animation_name: String,
    pub fps: f32,
    pub loop_animation: bool,
    pub export_individual_frames: bool,
    pub frame_size: Option<(u32, u32)>,
    pub filter: ResampleFilter,
}

impl Default for GodotConfig {
    fn default() -> Self {
        Self {
            animation_name: "default".to_string(),
            fps: 10.0,
            loop_animation: true,
            export_individual_frames: true,
            frame_size: None,
            filter: ResampleFilter::Lanczos,
        }
    }
}

/// Lossy PNG recompression through an external `pngquant`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pngquant {
    pub path: PathBuf,
    pub quality_min: u8,
    pub quality_max: u8,
}

impl Pngquant {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            quality_min: 60,
            quality_max: 80,
        }
    }

    pub fn is_available(&self) -> bool {
        Command::new(&self.path).arg("--version").output().is_ok()
    }

    /// Compresses `file` in place, returning `(before, after)` sizes in bytes.
    /// Exit code 99 (quality not reached, file still written) counts as success.
    pub fn compress(&self, file: &Path) -> Result<(u64, u64)> {
        let before = file_size(file)?;
        let output = Command::new(&self.path)
            .arg(format!("--quality={}-{}", self.quality_min, self.quality_max))
            .args(["--force", "--ext", ".png"])
            .arg(file)
            .output()
            .map_err(|e| spawn_error(&self.path, "compress", e))?;

        match output.status.code() {
            Some(0) | Some(99) => Ok((before, file_size(file)?)),
            code => Err(SpriteCullError::ExternalTool {
                tool: self.path.display().to_string(),
                operation: "compress".to_string(),
                reason: format!(
                    "exit code {:?}: {}",
                    code,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }

    /// Compresses every file, skipping failures. Returns the summed sizes of
    /// the files that succeeded.
    fn compress_all(&self, files: &[PathBuf]) -> (u64, u64) {
        files
            .iter()
            .filter_map(|file| match self.compress(file) {
                Ok(sizes) => Some(sizes),
                Err(e) => {
                    tracing::warn!("pngquant skipped {}: {}", file.display(), e);
                    None
                }
            })
            .fold((0, 0), |(a, b), (x, y)| (a + x, b + y))
    }
}

fn file_size(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| SpriteCullError::fs(path, "stat", e))
}

pub fn format_file_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn compression_summary(before: u64, after: u64) -> Option<String> {
    if before == 0 {
        return None;
    }
    let saved = (1.0 - after as f64 / before as f64) * 100.0;
    Some(format!(
        "compressed {} -> {} (saved {:.1}%)",
        format_file_size(before),
        format_file_size(after),
        saved
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    pub format: ExportFormat,
    pub output_dir: PathBuf,
    /// File stem of every output.
    pub output_name: String,
    /// Extension for loose frame files.
    pub frame_format: String,
    pub sprite: SpriteSheetConfig,
    pub gif: GifConfig,
    pub godot: GodotConfig,
    pub pngquant: Option<Pngquant>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::SpriteSheet,
            output_dir: PathBuf::from("."),
            output_name: "sprite".to_string(),
            frame_format: "png".to_string(),
            sprite: SpriteSheetConfig::default(),
            gif: GifConfig::default(),
            godot: GodotConfig::default(),
            pngquant: None,
        }
    }
}

impl ExportConfig {
    pub fn output_file(&self) -> PathBuf {
        let ext = match self.format {
            ExportFormat::Gif => "gif",
            ExportFormat::Godot => "tres",
            ExportFormat::SpriteSheet | ExportFormat::Frames => "png",
        };
        self.output_dir.join(format!("{}.{}", self.output_name, ext))
    }

    pub fn json_file(&self) -> PathBuf {
        self.output_dir.join(format!("{}.json", self.output_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRect {
    pub frame_index: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpriteSheetMeta {
    pub image_path: String,
    pub image_width: u32,
    pub image_height: u32,
    pub frame_count: usize,
    pub frames: Vec<FrameRect>,
}

/// A frame to export with the index it has in the project.
#[derive(Debug, Clone)]
pub struct ExportFrame {
    pub index: usize,
    pub image: DynamicImage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    /// Sheet, GIF or `.tres` file; the output directory for loose frames.
    pub main_path: PathBuf,
    pub json_path: Option<PathBuf>,
    pub files: Vec<PathBuf>,
    pub info: Option<String>,
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| SpriteCullError::fs(dir, "create output directory", e))
}

fn save_image(image: &DynamicImage, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
    let image = match format {
        ImageFormat::Png | ImageFormat::WebP | ImageFormat::Tiff | ImageFormat::Tga => image.clone(),
        _ => DynamicImage::ImageRgb8(image.to_rgb8()),
    };
    image
        .save_with_format(path, format)
        .map_err(|e| SpriteCullError::ImageProcessing {
            path: path.display().to_string(),
            operation: "export".to_string(),
            source: Box::new(e),
        })
}

fn resized(image: &DynamicImage, size: Option<(u32, u32)>, filter: ResampleFilter) -> DynamicImage {
    match size {
        Some((w, h)) => resize_dynamic(image, w, h, filter),
        None => image.clone(),
    }
}

/// `(columns, rows)` for `count` frames.
pub fn grid_dimensions(layout: LayoutMode, columns: Option<u32>, count: u32) -> (u32, u32) {
    match layout {
        LayoutMode::Horizontal => (count, 1),
        LayoutMode::Vertical => (1, count),
        LayoutMode::Grid => {
            let cols = columns
                .filter(|c| *c > 0)
                .unwrap_or_else(|| (count as f64).sqrt().ceil() as u32)
                .max(1);
            (cols, count.div_ceil(cols))
        }
    }
}

/// Lays out `frames` into one image. The sheet has alpha when the first frame
/// does; cells are the size of the largest frame.
pub fn compose_sprite_sheet(
    frames: &[ExportFrame],
    config: &SpriteSheetConfig,
) -> Result<(DynamicImage, Vec<FrameRect>)> {
    if frames.is_empty() {
        return Err(SpriteCullError::validation("frames", "nothing to export"));
    }

    let images: Vec<DynamicImage> = frames
        .iter()
        .map(|f| resized(&f.image, config.frame_size, config.filter))
        .collect();
    let has_alpha = images[0].color().has_alpha();
    let cell_w = images.iter().map(|i| i.width()).max().unwrap_or(1);
    let cell_h = images.iter().map(|i| i.height()).max().unwrap_or(1);
    let (cols, rows) = grid_dimensions(config.layout, config.columns, images.len() as u32);
    let pad = config.padding;
    let sheet_w = cols * (cell_w + pad) - pad;
    let sheet_h = rows * (cell_h + pad) - pad;

    let mut background = config.background;
    if !has_alpha {
        background[3] = 255;
    }
    let mut sheet = RgbaImage::from_pixel(sheet_w, sheet_h, background);
    let mut rects = Vec::with_capacity(images.len());
    for (i, (frame, image)) in frames.iter().zip(&images).enumerate() {
        let i = i as u32;
        let x = (i % cols) * (cell_w + pad);
        let y = (i / cols) * (cell_h + pad);
        let cell = if has_alpha {
            image.to_rgba8()
        } else {
            DynamicImage::ImageRgb8(image.to_rgb8()).to_rgba8()
        };
        let (dx, dy) = offset_for(cell.width(), cell.height(), cell_w, cell_h, config.anchor)
            .unwrap_or((0, 0));
        sheet
            .copy_from(&cell, x + dx as u32, y + dy as u32)
            .map_err(|e| SpriteCullError::ImageProcessing {
                path: format!("frame #{}", frame.index),
                operation: "place frame on sheet".to_string(),
                source: Box::new(e),
            })?;
        rects.push(FrameRect {
            frame_index: frame.index,
            x,
            y,
            width: cell_w,
            height: cell_h,
        });
    }

    let sheet = if has_alpha {
        DynamicImage::ImageRgba8(sheet)
    } else {
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(sheet).to_rgb8())
    };
    Ok((sheet, rects))
}

pub fn export_sprite_sheet(frames: &[ExportFrame], config: &ExportConfig) -> Result<ExportReport> {
    let (sheet, rects) = compose_sprite_sheet(frames, &config.sprite)?;
    ensure_dir(&config.output_dir)?;
    let output = config.output_file();
    save_image(&sheet, &output)?;

    let mut info = None;
    if let Some(pngquant) = &config.pngquant {
        let (before, after) = pngquant.compress_all(std::slice::from_ref(&output));
        info = compression_summary(before, after);
    }

    let json_path = if config.sprite.generate_json {
        let meta = SpriteSheetMeta {
            image_path: output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            image_width: sheet.width(),
            image_height: sheet.height(),
            frame_count: rects.len(),
            frames: rects,
        };
        let path = config.json_file();
        let text = serde_json::to_string_pretty(&meta)?;
        fs::write(&path, text).map_err(|e| SpriteCullError::fs(&path, "write sheet metadata", e))?;
        Some(path)
    } else {
        None
    };

    tracing::info!(
        "exported {}x{} sprite sheet with {} frames to {}",
        sheet.width(),
        sheet.height(),
        frames.len(),
        output.display()
    );
    Ok(ExportReport {
        files: vec![output.clone()],
        main_path: output,
        json_path,
        info,
    })
}

/// Frame delay in milliseconds for `fps`.
pub fn gif_delay_ms(fps: f32) -> u32 {
    (1000.0 / fps) as u32
}

pub fn export_gif(frames: &[ExportFrame], config: &ExportConfig) -> Result<ExportReport> {
    if frames.is_empty() {
        return Err(SpriteCullError::validation("frames", "nothing to export"));
    }
    let gif = &config.gif;
    if !(gif.fps > 0.0) {
        return Err(SpriteCullError::validation("fps", "must be greater than zero"));
    }

    ensure_dir(&config.output_dir)?;
    let output = config.output_file();
    let file = File::create(&output).map_err(|e| SpriteCullError::fs(&output, "create gif", e))?;
    let speed = if gif.optimize { 1 } else { 10 };
    let mut encoder = GifEncoder::new_with_speed(BufWriter::new(file), speed);
    let repeat = match gif.loop_count {
        0 => Repeat::Infinite,
        n => Repeat::Finite(n),
    };
    let encode_err = |e: image::ImageError| SpriteCullError::ImageProcessing {
        path: output.display().to_string(),
        operation: "encode gif".to_string(),
        source: Box::new(e),
    };
    encoder.set_repeat(repeat).map_err(encode_err)?;

    let delay = Delay::from_numer_denom_ms(gif_delay_ms(gif.fps), 1);
    for frame in frames {
        let flat = DynamicImage::ImageRgb8(composite_over(&frame.image.to_rgba8(), Rgb([255, 255, 255])));
        let flat = resized(&flat, gif.frame_size, gif.filter);
        encoder
            .encode_frame(Frame::from_parts(flat.to_rgba8(), 0, 0, delay))
            .map_err(encode_err)?;
    }
    drop(encoder);

    tracing::info!("exported {} frame gif to {}", frames.len(), output.display());
    Ok(ExportReport {
        files: vec![output.clone()],
        main_path: output,
        json_path: None,
        info: None,
    })
}

/// Writes each frame as `{name}_{index:04}.{ext}` using its project index.
pub fn export_frames(frames: &[ExportFrame], config: &ExportConfig) -> Result<ExportReport> {
    if frames.is_empty() {
        return Err(SpriteCullError::validation("frames", "nothing to export"));
    }
    ensure_dir(&config.output_dir)?;

    let mut files = Vec::with_capacity(frames.len());
    for frame in frames {
        let path = config.output_dir.join(format!(
            "{}_{:04}.{}",
            config.output_name, frame.index, config.frame_format
        ));
        save_image(&frame.image, &path)?;
        files.push(path);
    }

    let mut info = None;
    if let Some(pngquant) = &config.pngquant {
        let pngs: Vec<PathBuf> = files
            .iter()
            .filter(|p| ImageFormat::from_path(p).ok() == Some(ImageFormat::Png))
            .cloned()
            .collect();
        let (before, after) = pngquant.compress_all(&pngs);
        info = compression_summary(before, after);
    }

    tracing::info!("exported {} frames to {}", files.len(), config.output_dir.display());
    Ok(ExportReport {
        main_path: config.output_dir.clone(),
        json_path: None,
        files,
        info,
    })
}

/// Text of a Godot 4 `SpriteFrames` resource referencing `textures` by
/// relative path.
pub fn godot_tres(textures: &[String], animation_name: &str, fps: f32, loop_animation: bool) -> String {
    let ext_resources: Vec<String> = textures
        .iter()
        .enumerate()
        .map(|(i, path)| format!("[ext_resource type=\"Texture2D\" path=\"{}\" id=\"{}\"]", path, i + 1))
        .collect();
    let frames: Vec<String> = (1..=textures.len())
        .map(|id| format!("{{\n\"duration\": 1.0,\n\"texture\": ExtResource(\"{}\")\n}}", id))
        .collect();

    format!(
        "[gd_resource type=\"SpriteFrames\" load_steps={} format=3]\n\n{}\n\n[resource]\n\n\
         animations = [{{\n\"frames\": [{}],\n\"loop\": {},\n\"name\": \"{}\",\n\"speed\": {:?}\n}}]\n",
        textures.len() + 1,
        ext_resources.join("\n"),
        frames.join(", "),
        loop_animation,
        animation_name,
        fps
    )
}

pub fn export_godot(frames: &[ExportFrame], config: &ExportConfig) -> Result<ExportReport> {
    if frames.is_empty() {
        return Err(SpriteCullError::validation("frames", "nothing to export"));
    }
    let godot = &config.godot;
    ensure_dir(&config.output_dir)?;

    let mut files = Vec::new();
    let mut textures = Vec::new();
    if godot.export_individual_frames {
        for (i, frame) in frames.iter().enumerate() {
            let name = format!("{}_frame_{:04}.png", config.output_name, i);
            let path = config.output_dir.join(&name);
            save_image(&resized(&frame.image, godot.frame_size, godot.filter), &path)?;
            files.push(path);
            textures.push(name);
        }
    }

    let output = config.output_file();
    let text = godot_tres(&textures, &godot.animation_name, godot.fps, godot.loop_animation);
    fs::write(&output, text).map_err(|e| SpriteCullError::fs(&output, "write godot resource", e))?;
    files.push(output.clone());

    tracing::info!("exported godot resource {} with {} textures", output.display(), textures.len());
    Ok(ExportReport {
        main_path: output,
        json_path: None,
        files,
        info: Some(format!("{} frame files", textures.len())),
    })
}

pub fn export(frames: &[ExportFrame], config: &ExportConfig) -> Result<ExportReport> {
    match config.format {
        ExportFormat::SpriteSheet => export_sprite_sheet(frames, config),
        ExportFormat::Gif => export_gif(frames, config),
        ExportFormat::Frames => export_frames(frames, config),
        ExportFormat::Godot => export_godot(frames, config),
    }
}
