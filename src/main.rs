use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use image::{DynamicImage, Rgb, Rgba};
use rayon::ThreadPoolBuilder;
use tracing_subscriber::EnvFilter;

use sprite_cull_rs::background::{remove_backgrounds, AiParams, BackgroundMode, BackgroundRemover, ColorPreset, Outline};
use sprite_cull_rs::config::{check_format, Settings, DEFAULT_SETTINGS_FILE};
use sprite_cull_rs::cull::{cull, find_loop, restrict_to_loop};
use sprite_cull_rs::export::{export, ExportConfig, ExportFormat, ExportFrame, LayoutMode, Pngquant};
use sprite_cull_rs::features::{analyze_project, DetectMode, DEFAULT_REGION_WEIGHTS};
use sprite_cull_rs::frames::{FrameProject, ImageSource, MANIFEST_FILE};
use sprite_cull_rs::imageops::color::composite_on_checkerboard;
use sprite_cull_rs::imageops::{Position, ResampleFilter};
use sprite_cull_rs::pose::{draw_pose, PoseStyle};
use sprite_cull_rs::model::{available_models, AiModel, MattingSessionCache};
use sprite_cull_rs::progress_tracker::{progress_bar, CancelFlag};
use sprite_cull_rs::rtmpose::{default_paths, RtmPoseModel};
use sprite_cull_rs::transform::{crop_frames, load_frames, outline_frames, scale_frames, shrink_frames, Margins, ScaleTarget};
use sprite_cull_rs::upscale::{upscale_frames, RealEsrgan, UpscaleModel};
use sprite_cull_rs::video::{format_timestamp, probe, sample_timestamps, FrameExtractor};
use sprite_cull_rs::PoseEstimator;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Frame project directory.
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Repeat for more detail.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show stream information of a video.
    Probe {
        video: PathBuf,
        /// Also write the frame shown at `--at` to this image.
        #[arg(long)]
        thumbnail: Option<PathBuf>,
        #[arg(long, default_value_t = 0.0, requires = "thumbnail")]
        at: f64,
    },
    /// Sample frames from a video into the project.
    Extract(ExtractArgs),
    /// Add every image under a directory to the project.
    Import {
        dir: PathBuf,
        /// Assign timestamps at this rate.
        #[arg(long)]
        fps: Option<f64>,
    },
    /// List frames with their status.
    List,
    /// Render one frame over a checkerboard, optionally with its skeleton.
    Preview {
        index: usize,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, value_enum, default_value = "processed")]
        source: ImageSource,
        /// Overlay the detected pose, if any.
        #[arg(long)]
        pose: bool,
    },
    /// Change which frames are selected.
    #[command(subcommand)]
    Select(SelectCommand),
    Scale(ScaleArgs),
    /// Crop all frames to their shared content box.
    Crop(CropArgs),
    /// Erode the alpha edge of matted frames.
    ShrinkEdges {
        #[arg(long, default_value_t = 1)]
        px: u32,
        #[command(flatten)]
        scope: Scope,
    },
    RemoveBg(RemoveBgArgs),
    Outline {
        #[arg(long, default_value_t = 2)]
        thickness: u32,
        #[arg(long, value_parser = parse_rgb, default_value = "#000000")]
        color: Rgb<u8>,
        #[command(flatten)]
        scope: Scope,
    },
    /// Compute similarity features of the selected frames.
    Analyze(AnalyzeArgs),
    /// Keep one frame per run of near-duplicates.
    Cull {
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Find the frame that best closes the animation loop.
    FindLoop {
        /// Deselect everything outside the loop.
        #[arg(long)]
        restrict: bool,
    },
    Export(ExportArgs),
    Upscale(UpscaleArgs),
    /// List matting, pose and upscale models and whether they are installed.
    Models,
}

#[derive(Args)]
struct ExtractArgs {
    video: PathBuf,
    #[arg(long)]
    fps: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    start: f64,
    /// Defaults to the end of the video.
    #[arg(long)]
    end: Option<f64>,
}

#[derive(Subcommand)]
enum SelectCommand {
    All,
    #[command(name = "none")]
    Clear,
    /// Add `start..=end` to the selection.
    Range { start: usize, end: usize },
    /// Keep every n-th selected frame.
    Interval { every: usize },
    /// Select exactly these frames.
    Only { indices: Vec<usize> },
}

/// Frames a batch command works on.
#[derive(Args)]
struct Scope {
    /// All frames instead of the selected ones.
    #[arg(long)]
    all: bool,
}

impl Scope {
    fn indices(&self, project: &FrameProject) -> Vec<usize> {
        if self.all {
            (0..project.len()).collect()
        } else {
            project.selected_indices()
        }
    }
}

#[derive(Args)]
struct ScaleArgs {
    #[arg(long, conflicts_with = "size", required_unless_present = "size")]
    percent: Option<f32>,
    #[arg(long, value_parser = parse_size)]
    size: Option<(u32, u32)>,
    #[arg(long, value_enum, default_value = "lanczos")]
    filter: ResampleFilter,
    #[command(flatten)]
    scope: Scope,
}

#[derive(Args)]
struct CropArgs {
    /// Margin on every side, overridden per side below.
    #[arg(long, default_value_t = 0)]
    margin: u32,
    #[arg(long)]
    top: Option<u32>,
    #[arg(long)]
    bottom: Option<u32>,
    #[arg(long)]
    left: Option<u32>,
    #[arg(long)]
    right: Option<u32>,
    #[command(flatten)]
    scope: Scope,
}

#[derive(Args)]
struct RemoveBgArgs {
    #[arg(long, value_enum, default_value = "ai")]
    mode: BackgroundMode,
    #[arg(long, value_enum, default_value = "isnet-anime")]
    model: AiModel,
    /// Binarise the mask above this level (0 keeps it soft).
    #[arg(long, default_value_t = 0)]
    alpha_threshold: u8,
    /// Positive erodes the mask, negative dilates it.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    erode: i32,
    #[arg(long, default_value_t = 0)]
    feather: u32,
    #[arg(long)]
    cpu: bool,
    #[arg(long)]
    device_id: Option<i32>,
    /// Outline thickness in pixels.
    #[arg(long)]
    outline: Option<u32>,
    #[arg(long, value_parser = parse_rgb, default_value = "#000000")]
    outline_color: Rgb<u8>,
    #[arg(long, value_enum, default_value = "green")]
    preset: ColorPreset,
    /// Keep the keyed colour instead of removing it.
    #[arg(long)]
    invert: bool,
    #[arg(long, default_value_t = 1)]
    denoise: u32,
    #[arg(long, value_enum, default_value = "original")]
    source: ImageSource,
    #[command(flatten)]
    scope: Scope,
}

#[derive(Args)]
struct AnalyzeArgs {
    #[arg(long, value_enum)]
    mode: Option<DetectMode>,
    /// Upper, middle and lower band weights for regional mode.
    #[arg(long, value_delimiter = ',', num_args = 3, default_values_t = DEFAULT_REGION_WEIGHTS)]
    weights: Vec<f32>,
    /// RTMPose model; defaults to the one under the model directory.
    #[arg(long)]
    pose_model: Option<PathBuf>,
    #[arg(long, requires = "pose_model")]
    detector: Option<PathBuf>,
    #[arg(long)]
    cpu: bool,
}

#[derive(Args)]
struct ExportArgs {
    #[arg(long, value_enum, default_value = "sprite-sheet")]
    format: ExportFormat,
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long, default_value = "sprite")]
    name: String,
    #[arg(long, value_enum, default_value = "grid")]
    layout: LayoutMode,
    #[arg(long)]
    columns: Option<u32>,
    #[arg(long, default_value_t = 0)]
    padding: u32,
    /// Resize every frame to `WxH`.
    #[arg(long, value_parser = parse_size)]
    size: Option<(u32, u32)>,
    #[arg(long, value_enum, default_value = "lanczos")]
    filter: ResampleFilter,
    #[arg(long, value_parser = parse_rgba, default_value = "#00000000")]
    background: Rgba<u8>,
    #[arg(long, value_enum, default_value = "bottom")]
    anchor: Position,
    #[arg(long)]
    no_json: bool,
    #[arg(long, default_value_t = 10.0)]
    fps: f32,
    /// GIF repeat count, 0 for forever.
    #[arg(long = "loop", default_value_t = 0)]
    loop_count: u16,
    #[arg(long)]
    no_optimize: bool,
    #[arg(long, default_value = "default")]
    animation: String,
    #[arg(long)]
    no_loop_animation: bool,
    #[arg(long)]
    no_frame_files: bool,
    #[arg(long, value_parser = check_format, default_value = "png")]
    frame_format: String,
    #[arg(long)]
    pngquant: bool,
    #[arg(long, value_parser = parse_quality, default_value = "60-80")]
    quality: (u8, u8),
    #[arg(long, value_enum, default_value = "processed")]
    source: ImageSource,
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(long, value_enum, default_value = "realesrgan-x4plus-anime")]
    model: UpscaleModel,
    /// Tile size, 0 for automatic.
    #[arg(long, default_value_t = 0)]
    tile: u32,
    /// Defaults to `models/` next to the executable.
    #[arg(long)]
    models_dir: Option<PathBuf>,
    #[command(flatten)]
    scope: Scope,
}

fn parse_size(s: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got {}", s))?;
    let w: u32 = w.trim().parse().map_err(|e| format!("width: {}", e))?;
    let h: u32 = h.trim().parse().map_err(|e| format!("height: {}", e))?;
    if w == 0 || h == 0 {
        return Err("width and height must be non-zero".to_string());
    }
    Ok((w, h))
}

fn parse_hex(s: &str, channels: usize) -> std::result::Result<Vec<u8>, String> {
    let hex = s.trim_start_matches('#');
    if hex.len() != channels * 2 || !hex.is_ascii() {
        let expected = if channels == 3 { "#rrggbb" } else { "#rrggbbaa" };
        return Err(format!("expected {}, got {}", expected, s));
    }
    (0..channels)
        .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

fn parse_rgb(s: &str) -> std::result::Result<Rgb<u8>, String> {
    let c = parse_hex(s, 3)?;
    Ok(Rgb([c[0], c[1], c[2]]))
}

fn parse_rgba(s: &str) -> std::result::Result<Rgba<u8>, String> {
    let c = parse_hex(s, 4)?;
    Ok(Rgba([c[0], c[1], c[2], c[3]]))
}

fn parse_quality(s: &str) -> std::result::Result<(u8, u8), String> {
    let (lo, hi) = s.split_once('-').ok_or_else(|| format!("expected MIN-MAX, got {}", s))?;
    let lo: u8 = lo.parse().map_err(|e| format!("min: {}", e))?;
    let hi: u8 = hi.parse().map_err(|e| format!("max: {}", e))?;
    if lo > hi || hi > 100 {
        return Err("quality must satisfy MIN <= MAX <= 100".to_string());
    }
    Ok((lo, hi))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("warn,sprite_cull_rs={level},sprite_cull={level}"))
        }))
        .init();
}

fn open_or_create(root: &Path) -> Result<FrameProject> {
    if root.join(MANIFEST_FILE).exists() {
        Ok(FrameProject::open(root)?)
    } else {
        Ok(FrameProject::create(root, None)?)
    }
}

fn non_empty(indices: Vec<usize>) -> Result<Vec<usize>> {
    ensure!(!indices.is_empty(), "no frames to process; check the selection");
    Ok(indices)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Some(threads) = cli.threads {
        ThreadPoolBuilder::new().num_threads(threads).build_global()?;
    }
    let mut settings = Settings::load(&cli.settings)?;
    let cancel = CancelFlag::new();
    if let Err(e) = cancel.cancel_on_interrupt() {
        tracing::warn!("{}", e);
    }

    match &cli.command {
        Command::Probe { video, thumbnail, at } => {
            let info = probe(&settings.ffprobe_path, video)?;
            println!("{}", info.path.display());
            println!("  resolution: {}", info.resolution());
            println!("  fps:        {:.3}", info.fps);
            println!("  frames:     {}", info.frame_count);
            println!("  duration:   {}", info.format_duration());
            println!("  codec:      {}", info.codec);
            if let Some(path) = thumbnail {
                let frame = FrameExtractor::new(&settings.ffmpeg_path)
                    .extract_single(&info, *at)?
                    .with_context(|| format!("no frame at {}", format_timestamp(*at)))?;
                frame
                    .save(path)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("  thumbnail:  {}", path.display());
            }
        }
        Command::Extract(args) => {
            let info = probe(&settings.ffprobe_path, &args.video)?;
            let fps = args.fps.unwrap_or(settings.extract_fps);
            let end = args.end.unwrap_or(info.duration);
            let planned = sample_timestamps(args.start, end, fps)?.len();

            let mut project = if cli.project.join(MANIFEST_FILE).exists() {
                FrameProject::open(&cli.project)?
            } else {
                FrameProject::create(&cli.project, Some(info.clone()))?
            };
            let progress = progress_bar(planned as u64, "extracting");
            let extractor = FrameExtractor::new(&settings.ffmpeg_path);
            let count = extractor.extract(&info, args.start, end, fps, &cancel, |frame| {
                project.add_frame(&DynamicImage::ImageRgb8(frame.image), frame.timestamp)?;
                progress.inc(1);
                Ok(())
            })?;
            progress.finish();
            project.save()?;
            println!(
                "extracted {} frames ({} - {}) into {}",
                count,
                format_timestamp(args.start),
                format_timestamp(end),
                project.root().display()
            );

            settings.last_video_dir = args.video.parent().map(Path::to_path_buf);
            settings.save(&cli.settings)?;
        }
        Command::Import { dir, fps } => {
            let mut project = open_or_create(&cli.project)?;
            let count = project.import_dir(dir, *fps)?;
            project.save()?;
            println!("imported {} images", count);
        }
        Command::List => {
            let project = FrameProject::open(&cli.project)?;
            for frame in project.frames() {
                println!(
                    "{} {:>4} {} {:?}{}",
                    if frame.is_selected { "*" } else { " " },
                    frame.index,
                    format_timestamp(frame.timestamp),
                    frame.status,
                    if frame.has_processed() { " (processed)" } else { "" }
                );
            }
            println!("{} frames, {} selected", project.len(), project.selected_indices().len());
        }
        Command::Preview {
            index,
            output,
            source,
            pose,
        } => {
            let project = FrameProject::open(&cli.project)?;
            let image = project.load_image(*index, *source)?;
            let mut canvas = if image.color().has_alpha() {
                composite_on_checkerboard(&image.to_rgba8(), 16)
            } else {
                image.to_rgb8()
            };
            if *pose {
                let id = project.frame(*index).map(|f| f.id).context("frame missing")?;
                match project.features().and_then(|f| f.pose(id)) {
                    Some(data) => canvas = draw_pose(&canvas, data, &PoseStyle::default()),
                    None => tracing::warn!("frame {} has no detected pose", index),
                }
            }
            canvas
                .save(output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("wrote {}", output.display());
        }
        Command::Select(select) => {
            let mut project = FrameProject::open(&cli.project)?;
            match select {
                SelectCommand::All => project.select_all(),
                SelectCommand::Clear => project.deselect_all(),
                SelectCommand::Range { start, end } => project.select_range(*start, *end),
                SelectCommand::Interval { every } => project.select_interval(*every),
                SelectCommand::Only { indices } => {
                    project.deselect_all();
                    for &index in indices {
                        project.select(index, true);
                    }
                }
            }
            project.save()?;
            println!("{} of {} frames selected", project.selected_indices().len(), project.len());
        }
        Command::Scale(args) => {
            let mut project = FrameProject::open(&cli.project)?;
            let indices = non_empty(args.scope.indices(&project))?;
            let target = match (args.percent, args.size) {
                (_, Some((w, h))) => ScaleTarget::Fixed(w, h),
                (Some(pct), None) => ScaleTarget::Percent(pct),
                (None, None) => bail!("either --percent or --size is required"),
            };
            let progress = progress_bar(indices.len() as u64, "scaling");
            let written = scale_frames(&mut project, &indices, target, args.filter, &progress, &cancel)?;
            project.save()?;
            println!("scaled {} frames", written);
        }
        Command::Crop(args) => {
            let mut project = FrameProject::open(&cli.project)?;
            let indices = non_empty(args.scope.indices(&project))?;
            let margins = Margins {
                top: args.top.unwrap_or(args.margin),
                bottom: args.bottom.unwrap_or(args.margin),
                left: args.left.unwrap_or(args.margin),
                right: args.right.unwrap_or(args.margin),
            };
            let progress = progress_bar(indices.len() as u64, "cropping");
            let bounds = crop_frames(&mut project, &indices, margins, &progress, &cancel)?;
            project.save()?;
            println!("cropped {} frames to {}x{}", indices.len(), bounds.width(), bounds.height());
        }
        Command::ShrinkEdges { px, scope } => {
            let mut project = FrameProject::open(&cli.project)?;
            let indices = non_empty(scope.indices(&project))?;
            let progress = progress_bar(indices.len() as u64, "shrinking edges");
            let written = shrink_frames(&mut project, &indices, *px, &progress, &cancel)?;
            project.save()?;
            println!("shrank {} frames ({} without alpha skipped)", written, indices.len() - written);
        }
        Command::RemoveBg(args) => remove_bg(&cli, &settings, args, &cancel)?,
        Command::Outline { thickness, color, scope } => {
            let mut project = FrameProject::open(&cli.project)?;
            let indices = non_empty(scope.indices(&project))?;
            let progress = progress_bar(indices.len() as u64, "outlining");
            let written = outline_frames(&mut project, &indices, *thickness, *color, &progress, &cancel)?;
            project.save()?;
            println!("outlined {} frames ({} without alpha skipped)", written, indices.len() - written);
        }
        Command::Analyze(args) => {
            let mut project = FrameProject::open(&cli.project)?;
            let mode = args.mode.unwrap_or(settings.detect_mode);
            let weights: [f32; 3] = args
                .weights
                .as_slice()
                .try_into()
                .context("--weights takes exactly three values")?;

            let estimator = if mode == DetectMode::Pose {
                let model = match &args.pose_model {
                    Some(path) => RtmPoseModel::new(path, args.detector.as_deref(), settings.device_id, args.cpu)?,
                    None => RtmPoseModel::from_dir(&settings.rtmpose_dir(), settings.device_id, args.cpu)?,
                };
                Some(model)
            } else {
                None
            };

            let progress = progress_bar(project.selected_indices().len() as u64, "analysing");
            let found = analyze_project(
                &mut project,
                mode,
                estimator.as_ref().map(|m| m as &dyn PoseEstimator),
                weights,
                &progress,
                &cancel,
            )?;
            project.save()?;
            println!("{} features for {} of {} selected frames", mode, found, project.selected_indices().len());
        }
        Command::Cull { threshold } => {
            let mut project = FrameProject::open(&cli.project)?;
            let report = cull(&mut project, threshold.unwrap_or(settings.similarity_threshold))?;
            project.save()?;
            for group in &report.groups {
                println!("  #{} <- {:?}", group.anchor, &group.members[1..]);
            }
            println!("kept {} frames, deselected {}", report.kept, report.removed);
        }
        Command::FindLoop { restrict } => {
            let mut project = FrameProject::open(&cli.project)?;
            let point = find_loop(&project)?;
            println!(
                "frame #{} repeats #{} (similarity {:.3}); loop ends at #{}",
                point.loop_frame, point.first, point.similarity, point.suggested_end
            );
            if *restrict {
                restrict_to_loop(&mut project, &point);
                project.save()?;
                println!("{} frames selected", project.selected_indices().len());
            }
        }
        Command::Export(args) => export_frames(&cli, &mut settings, args)?,
        Command::Upscale(args) => {
            let Some(executable) = settings.realesrgan_path.clone() else {
                bail!("realesrgan_path is not set in {}", cli.settings.display());
            };
            let mut upscaler = RealEsrgan::new(executable);
            if let Some(dir) = &args.models_dir {
                upscaler = upscaler.with_models_dir(dir);
            }
            let mut project = FrameProject::open(&cli.project)?;
            let indices = non_empty(args.scope.indices(&project))?;
            let progress = progress_bar(indices.len() as u64, "upscaling");
            let written = upscale_frames(&mut project, &indices, &upscaler, args.model, args.tile, &progress, &cancel)?;
            project.save()?;
            println!("upscaled {} frames x{}", written, args.model.scale());
        }
        Command::Models => list_models(&settings),
    }
    Ok(())
}

fn remove_bg(cli: &Cli, settings: &Settings, args: &RemoveBgArgs, cancel: &CancelFlag) -> Result<()> {
    let mut project = FrameProject::open(&cli.project)?;
    let indices = non_empty(args.scope.indices(&project))?;
    let progress = progress_bar(indices.len() as u64, "removing background");

    let written = match args.mode {
        BackgroundMode::Ai => {
            let cache = MattingSessionCache::new();
            let model = cache.get_or_load(
                args.model,
                &settings.model_dir,
                args.device_id.unwrap_or(settings.device_id),
                args.cpu,
            )?;
            let params = AiParams {
                model: args.model,
                alpha_threshold: args.alpha_threshold,
                erode: args.erode,
                feather: args.feather,
                force_cpu: args.cpu,
                outline: args.outline.map(|thickness| Outline {
                    thickness,
                    color: args.outline_color,
                }),
            };
            let remover = BackgroundRemover::Ai {
                model: &*model,
                params,
            };
            remove_backgrounds(&mut project, &indices, &remover, args.source, &progress, cancel)?
        }
        BackgroundMode::Color => {
            let mut params = args.preset.params();
            params.invert = args.invert;
            params.feather = args.feather;
            params.denoise = args.denoise;
            let remover = BackgroundRemover::Color(params);
            remove_backgrounds(&mut project, &indices, &remover, args.source, &progress, cancel)?
        }
    };
    project.save()?;
    println!("removed background from {} frames", written);
    Ok(())
}

fn export_frames(cli: &Cli, settings: &mut Settings, args: &ExportArgs) -> Result<()> {
    let project = FrameProject::open(&cli.project)?;
    let indices = non_empty(project.selected_indices())?;
    let images = load_frames(&project, &indices, args.source, &progress_bar(indices.len() as u64, "loading"))?;
    let frames: Vec<ExportFrame> = indices
        .iter()
        .zip(images)
        .map(|(&index, image)| ExportFrame { index, image })
        .collect();

    let output_dir = args
        .output
        .clone()
        .or_else(|| settings.last_export_dir.clone())
        .unwrap_or_else(|| PathBuf::from("export"));
    let pngquant = if args.pngquant {
        let mut tool = Pngquant::new(settings.pngquant_path.clone().unwrap_or_else(|| PathBuf::from("pngquant")));
        (tool.quality_min, tool.quality_max) = args.quality;
        if tool.is_available() {
            Some(tool)
        } else {
            tracing::warn!("pngquant not found at {}, skipping compression", tool.path.display());
            None
        }
    } else {
        None
    };

    let mut config = ExportConfig {
        format: args.format,
        output_dir: output_dir.clone(),
        output_name: args.name.clone(),
        frame_format: args.frame_format.clone(),
        pngquant,
        ..ExportConfig::default()
    };
    config.sprite.layout = args.layout;
    config.sprite.columns = args.columns;
    config.sprite.padding = args.padding;
    config.sprite.frame_size = args.size;
    config.sprite.background = args.background;
    config.sprite.generate_json = !args.no_json;
    config.sprite.filter = args.filter;
    config.sprite.anchor = args.anchor;
    config.gif.fps = args.fps;
    config.gif.loop_count = args.loop_count;
    config.gif.optimize = !args.no_optimize;
    config.gif.frame_size = args.size;
    config.gif.filter = args.filter;
    config.godot.animation_name = args.animation.clone();
    config.godot.fps = args.fps;
    config.godot.loop_animation = !args.no_loop_animation;
    config.godot.export_individual_frames = !args.no_frame_files;
    config.godot.frame_size = args.size;
    config.godot.filter = args.filter;

    let report = export(&frames, &config)?;
    println!("exported {}", report.main_path.display());
    if let Some(json) = &report.json_path {
        println!("metadata {}", json.display());
    }
    if let Some(info) = &report.info {
        println!("{}", info);
    }

    settings.last_export_dir = Some(output_dir);
    settings.save(&cli.settings)?;
    Ok(())
}

fn list_models(settings: &Settings) {
    println!("matting models ({}):", settings.model_dir.display());
    for status in available_models(&settings.model_dir) {
        let state = match &status.path {
            Some(path) => format!("installed at {}", path.display()),
            None => format!("missing ({})", status.model.download_size()),
        };
        println!("  {:<18} {:<28} {}", status.model.name(), status.model.display_name(), state);
    }

    let (detector, pose) = default_paths(&settings.rtmpose_dir());
    println!("pose models ({}):", settings.rtmpose_dir().display());
    for path in [pose, detector] {
        let state = if path.is_file() { "installed" } else { "missing" };
        println!("  {} {}", path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(), state);
    }

    match &settings.realesrgan_path {
        Some(executable) => {
            let upscaler = RealEsrgan::new(executable);
            println!("upscale models ({}):", upscaler.executable().display());
            for (model, installed) in upscaler.available_models() {
                println!(
                    "  {:<26} x{} {}",
                    model.name(),
                    model.scale(),
                    if installed { "installed" } else { "missing" }
                );
            }
        }
        None => println!("upscaling disabled: realesrgan_path not set"),
    }
}
