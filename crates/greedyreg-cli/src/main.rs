//! Command-line driver for the greedyreg registration engine.

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::info;

use greedyreg_core::image::ScalingMode;
use greedyreg_core::Field;
use greedyreg_io::{
    is_image_file, read_image, read_matrix, read_warp_physical, write_image, write_matrix,
    write_warp,
};
use greedyreg_registration::affine::run_affine;
use greedyreg_registration::brute::run_brute;
use greedyreg_registration::deformable::{compute_inverse, run_deformable, DumpOptions};
use greedyreg_registration::params::{GreedyParams, MetricKind, SigmaSpec};
use greedyreg_registration::pyramid::{ImagePair, Pyramid, DEFAULT_NOISE_AMPLITUDE};
use greedyreg_registration::reslice::{
    compose_chain, reslice_image, reslice_labels, ChainEntry, ResliceInterp,
};

/// Greedy diffeomorphic and affine registration of N-dimensional images.
#[derive(Parser)]
#[command(name = "greedyreg", version, about)]
struct Cli {
    /// Number of image dimensions (2, 3 or 4)
    #[arg(short = 'd', long = "dim", default_value_t = 2)]
    dim: usize,

    /// Fixed/moving image pair (repeatable)
    #[arg(short = 'i', long = "input", num_args = 2, value_names = ["FIXED", "MOVING"], action = ArgAction::Append, value_parser = clap::value_parser!(String))]
    input: Vec<Vec<String>>,

    /// Weight of the k-th input pair (repeatable; pairs without a weight
    /// default to 1)
    #[arg(short = 'w', long = "weight", action = ArgAction::Append)]
    weight: Vec<f64>,

    /// Output file: warp image, or matrix in affine mode
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Metric: SSD, `NCC AxBxC` (patch radius), or MI
    #[arg(short = 'm', long = "metric", num_args = 1..=2)]
    metric: Option<Vec<String>>,

    /// Iterations per multi-resolution level, coarse to fine (e.g. 100x100)
    #[arg(short = 'n', long = "iterations", default_value = "100x100")]
    iterations: String,

    /// Step size
    #[arg(short = 'e', long = "epsilon", default_value_t = 1.0)]
    epsilon: f64,

    /// Pre- and post-update smoothing sigmas with units (e.g. 1.732vox 0.7071vox)
    #[arg(short = 's', long = "smoothing", num_args = 2, value_names = ["SIGMA_PRE", "SIGMA_POST"])]
    smoothing: Option<Vec<String>>,

    /// Step-size policy: CONST, SCALE or SCALEDOWN
    #[arg(long = "tscale", default_value = "SCALE")]
    tscale: String,

    /// Gradient mask image
    #[arg(long = "gm")]
    gradient_mask: Option<String>,

    /// Initial affine transform spec (file[,exponent])
    #[arg(long = "ia")]
    initial_affine: Option<String>,

    /// Transforms applied to the moving images before registration
    #[arg(long = "it", num_args = 1.., value_name = "TRANSFORM")]
    moving_pre_transforms: Vec<String>,

    /// Affine registration mode
    #[arg(short = 'a', long = "affine")]
    affine: bool,

    /// Brute-force mode with the given search radius (e.g. 4x4)
    #[arg(long = "brute", value_name = "RADIUS")]
    brute: Option<String>,

    /// Reslice mode: chain of transform specs applied to the moving images
    #[arg(short = 'r', long = "reslice", num_args = 0.., value_name = "TRANSFORM")]
    reslice: Option<Vec<String>>,

    /// Reference image for reslicing
    #[arg(long = "rf", value_name = "FIXED")]
    reslice_reference: Option<String>,

    /// Moving/output image pair for reslicing (repeatable)
    #[arg(long = "rm", num_args = 2, value_names = ["MOVING", "OUTPUT"], action = ArgAction::Append, value_parser = clap::value_parser!(String))]
    reslice_images: Vec<Vec<String>>,

    /// Interpolation for the k-th reslice pair onward: NN, LINEAR, or
    /// `LABEL sigma` (sigma in voxels of the label image)
    #[arg(long = "ri", num_args = 1..=2, action = ArgAction::Append, value_parser = clap::value_parser!(String))]
    reslice_interp: Vec<Vec<String>>,

    /// Output file for the inverse warp
    #[arg(long = "oinv")]
    inverse_warp: Option<String>,

    /// Square roots of the forward transform taken when inverse iteration
    /// stalls
    #[arg(long = "invexp", default_value_t = 2)]
    inverse_exponent: usize,

    /// Warp quantization precision in voxels (0 disables)
    #[arg(long = "wp", default_value_t = 0.1)]
    warp_precision: f64,

    /// Maximum number of worker threads (0 = library default)
    #[arg(long = "threads", default_value_t = 0)]
    threads: usize,

    /// Use Powell's method instead of L-BFGS in affine mode
    #[arg(long = "powell")]
    powell: bool,

    /// Check the affine gradient against finite differences
    #[arg(long = "debug-deriv")]
    debug_deriv: bool,

    /// Epsilon for the derivative check
    #[arg(long = "debug-deriv-eps", default_value_t = 1e-4)]
    debug_deriv_eps: f64,

    /// Dump intermediate fields every dump-freq iterations
    #[arg(long = "dump-moving")]
    dump_moving: bool,

    /// Dump frequency
    #[arg(long = "dump-freq", default_value_t = 1)]
    dump_frequency: usize,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_target(false).init();

    if cli.threads > 0 {
        info!("limiting the number of threads to {}", cli.threads);
        if let Err(err) = rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()
        {
            info!("thread pool already configured: {}", err);
        }
    } else {
        info!(
            "executing with the default number of threads: {}",
            rayon::current_num_threads()
        );
    }

    let outcome = match cli.dim {
        2 => run::<2>(&cli),
        3 => run::<3>(&cli),
        4 => run::<4>(&cli),
        d => Err(anyhow!("wrong number of dimensions requested: {}", d)),
    };

    if let Err(err) = outcome {
        eprintln!("ABORTING PROGRAM DUE TO RUNTIME EXCEPTION -- {:#}", err);
        std::process::exit(1);
    }
}

fn run<const D: usize>(cli: &Cli) -> Result<()> {
    if cli.reslice.is_some() {
        return run_reslice_mode::<D>(cli);
    }

    let params = build_params(cli)?;
    let output = cli
        .output
        .as_ref()
        .ok_or_else(|| anyhow!("an output file (-o) is required"))?;

    let pairs = load_pairs::<D>(cli)?;
    let mask = cli
        .gradient_mask
        .as_ref()
        .map(|path| read_image::<D, _>(path))
        .transpose()?;

    let initial = cli
        .initial_affine
        .as_ref()
        .map(|spec| {
            let (file, exponent) = parse_transform_spec(spec)?;
            read_matrix(&file, D, exponent)
        })
        .transpose()?;

    if let Some(radius_spec) = &cli.brute {
        let radius: Vec<i64> = parse_int_vector(radius_spec)?
            .into_iter()
            .map(|v| v as i64)
            .collect();
        let pyramid = Pyramid::build(&pairs, mask.as_ref(), 1, Some(DEFAULT_NOISE_AMPLITUDE))?;
        let (best_offsets, best_metric) = run_brute(&pyramid, &params, &radius)?;
        write_warp(output, &best_offsets, 0.0)?;
        write_image("mbest.nii.gz", &best_metric)?;
        return Ok(());
    }

    let noise = if params.metric.is_ncc() {
        Some(DEFAULT_NOISE_AMPLITUDE)
    } else {
        None
    };
    let pyramid = Pyramid::build(&pairs, mask.as_ref(), params.num_levels(), noise)?;

    if cli.affine {
        let ras = run_affine(&pyramid, &params, initial.as_ref())?;
        write_matrix(output, &ras)?;
        return Ok(());
    }

    let mut dump_sink = |tag: &str, level: usize, iter: usize, field: &Field<D>| {
        let path = format!("dump_{}_lev{:02}_iter{:04}.nii.gz", tag, level, iter);
        if let Err(err) = write_warp(&path, field, 0.0) {
            info!("failed to dump {}: {}", path, err);
        }
    };
    let dump = cli.dump_moving.then_some(DumpOptions {
        frequency: cli.dump_frequency,
        sink: &mut dump_sink,
    });

    let warp = run_deformable(&pyramid, &params, initial.as_ref(), dump)?;
    write_warp(output, &warp, params.warp_precision)?;

    if let Some(inverse_path) = &cli.inverse_warp {
        let (inverse, _converged) = compute_inverse(&warp, params.inverse_exponent);
        write_warp(inverse_path, &inverse, params.warp_precision)?;
    }
    Ok(())
}

fn run_reslice_mode<const D: usize>(cli: &Cli) -> Result<()> {
    let reference_path = cli
        .reslice_reference
        .as_ref()
        .ok_or_else(|| anyhow!("a reference image (--rf) is required for reslice commands"))?;
    if cli.reslice_images.is_empty() {
        bail!("at least one pair of moving/output images (--rm) is required for reslice commands");
    }

    let reference = read_image::<D, _>(reference_path)?;
    let ref_geom = reference.geometry().clone();

    let mut entries: Vec<ChainEntry<D>> = Vec::new();
    for spec in cli.reslice.as_deref().unwrap_or(&[]) {
        entries.push(load_chain_entry::<D>(spec)?);
    }
    let warp = compose_chain(&entries, &ref_geom)?;

    for (k, pair) in cli.reslice_images.iter().enumerate() {
        let (moving_path, output_path) = (&pair[0], &pair[1]);
        let interp = reslice_interp_for(cli, k)?;
        match interp {
            ResliceInterp::Label { sigma } => {
                let labels = read_image::<D, _>(moving_path)?;
                let out = reslice_labels(&labels, &warp, &ref_geom, sigma)?;
                write_image(output_path, &out)?;
            }
            ResliceInterp::Linear | ResliceInterp::Nearest => {
                let moving = read_image::<D, _>(moving_path)?;
                let nearest = interp == ResliceInterp::Nearest;
                let out = reslice_image(&moving, &warp, &ref_geom, nearest);
                write_image(output_path, &out)?;
            }
        }
    }
    Ok(())
}

/// Interpolation for the k-th reslice pair: the latest --ri at or before it,
/// defaulting to linear.
fn reslice_interp_for(cli: &Cli, k: usize) -> Result<ResliceInterp> {
    let spec = match cli.reslice_interp.iter().take(k + 1).last() {
        Some(spec) => spec,
        None => return Ok(ResliceInterp::Linear),
    };
    let mode = spec[0].to_ascii_uppercase();
    match mode.as_str() {
        "NN" | "0" => Ok(ResliceInterp::Nearest),
        "LINEAR" | "1" => Ok(ResliceInterp::Linear),
        "LABEL" => {
            let sigma = spec
                .get(1)
                .ok_or_else(|| anyhow!("LABEL interpolation requires a smoothing sigma"))?
                .parse::<f64>()
                .context("invalid LABEL smoothing sigma")?;
            Ok(ResliceInterp::Label { sigma })
        }
        other => bail!("unknown interpolation mode '{}'", other),
    }
}

fn load_chain_entry<const D: usize>(spec: &str) -> Result<ChainEntry<D>> {
    let (file, exponent) = parse_transform_spec(spec)?;
    if is_image_file(&file) {
        if exponent != 1.0 {
            bail!(
                "transform exponent {} is not supported for warp file {}",
                exponent,
                file
            );
        }
        Ok(ChainEntry::Warp(read_warp_physical::<D, _>(&file)?))
    } else {
        Ok(ChainEntry::Matrix(read_matrix(&file, D, exponent)?))
    }
}

/// Read the input pairs, applying the --it pre-transform chain to the
/// moving images.
fn load_pairs<const D: usize>(cli: &Cli) -> Result<Vec<ImagePair<D>>> {
    if cli.input.is_empty() {
        bail!("at least one image pair (-i) is required");
    }

    let mut pairs = Vec::with_capacity(cli.input.len());
    let mut pre_warp: Option<Field<D>> = None;
    for (k, pair) in cli.input.iter().enumerate() {
        let fixed = read_image::<D, _>(&pair[0])
            .with_context(|| format!("failed to read fixed image {}", pair[0]))?;
        let moving = read_image::<D, _>(&pair[1])
            .with_context(|| format!("failed to read moving image {}", pair[1]))?;

        // The pre-transform chain is composed once, over the first fixed
        // image's space.
        if !cli.moving_pre_transforms.is_empty() && pre_warp.is_none() {
            let mut entries = Vec::new();
            for spec in &cli.moving_pre_transforms {
                entries.push(load_chain_entry::<D>(spec)?);
            }
            pre_warp = Some(compose_chain(&entries, fixed.geometry())?);
        }

        let moving = match &pre_warp {
            Some(warp) => reslice_image(&moving, warp, fixed.geometry(), false),
            None => moving,
        };

        pairs.push(ImagePair {
            fixed,
            moving,
            weight: cli.weight.get(k).copied().unwrap_or(1.0),
        });
    }
    Ok(pairs)
}

fn build_params(cli: &Cli) -> Result<GreedyParams> {
    let metric = match cli.metric.as_deref() {
        None => MetricKind::Ssd,
        Some(parts) => {
            let name = parts[0].to_ascii_uppercase();
            match name.as_str() {
                "SSD" => MetricKind::Ssd,
                "NCC" => {
                    let radius_spec = parts
                        .get(1)
                        .ok_or_else(|| anyhow!("NCC metric requires a radius (e.g. 2x2x2)"))?;
                    MetricKind::Ncc {
                        radius: parse_int_vector(radius_spec)?,
                    }
                }
                "MI" => MetricKind::Mi,
                other => bail!("unknown metric '{}'", other),
            }
        }
    };

    let time_step_mode = match cli.tscale.to_ascii_uppercase().as_str() {
        "CONST" => ScalingMode::Const,
        "SCALE" => ScalingMode::Scale,
        "SCALEDOWN" => ScalingMode::ScaleDown,
        other => bail!("unknown time step mode '{}'", other),
    };

    let (sigma_pre, sigma_post) = match cli.smoothing.as_deref() {
        None => (
            SigmaSpec::voxels(3.0f64.sqrt()),
            SigmaSpec::voxels(0.5f64.sqrt()),
        ),
        Some(parts) => (parse_sigma(&parts[0])?, parse_sigma(&parts[1])?),
    };

    let iter_per_level = parse_int_vector(&cli.iterations)?;
    if iter_per_level.is_empty() {
        bail!("the iteration schedule must name at least one level");
    }

    Ok(GreedyParams {
        metric,
        epsilon: cli.epsilon,
        time_step_mode,
        sigma_pre,
        sigma_post,
        iter_per_level,
        inverse_exponent: cli.inverse_exponent,
        warp_precision: cli.warp_precision,
        use_powell: cli.powell,
        deriv_epsilon: cli.debug_deriv_eps,
        debug_deriv: cli.debug_deriv,
    })
}

/// Parse an `AxBxC` integer vector.
fn parse_int_vector(spec: &str) -> Result<Vec<usize>> {
    spec.split('x')
        .map(|tok| {
            tok.parse::<usize>()
                .map_err(|_| anyhow!("expected an integer vector like 100x100, got '{}'", spec))
        })
        .collect()
}

/// Parse a sigma with its unit suffix (`vox` or `mm`).
fn parse_sigma(spec: &str) -> Result<SigmaSpec> {
    if let Some(value) = spec.strip_suffix("vox") {
        Ok(SigmaSpec::voxels(value.parse().with_context(|| {
            format!("invalid smoothing value '{}'", spec)
        })?))
    } else if let Some(value) = spec.strip_suffix("mm") {
        Ok(SigmaSpec::millimeters(value.parse().with_context(|| {
            format!("invalid smoothing value '{}'", spec)
        })?))
    } else {
        bail!(
            "smoothing parameter should include units, e.g. '3vox' or '3mm', instead got '{}'",
            spec
        )
    }
}

/// Parse a `file[,exponent]` transform spec.
fn parse_transform_spec(spec: &str) -> Result<(String, f64)> {
    match spec.split_once(',') {
        None => Ok((spec.to_string(), 1.0)),
        Some((file, exp)) => {
            let exponent: f64 = exp
                .parse()
                .map_err(|_| anyhow!("expected a number after comma in transform spec '{}'", spec))?;
            Ok((file.to_string(), exponent))
        }
    }
}
