use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bark_core::utils::{default_dtype, force_cpu_from_env, select_device};
use bark_core::{
    load_history_prompt, load_pipeline, write_wav, GenerationPipeline, LogProgress, VoiceCloner,
    VoiceLibrary,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bark", about = "Bark audio generation CLI")]
struct Cli {
    /// Directory holding tokenizer.json and the text/coarse/fine/codec weights
    #[arg(long, global = true, default_value = "models/bark")]
    model_dir: PathBuf,

    /// Use CPU even if GPU is available (also BARK_FORCE_CPU=1)
    #[arg(long, global = true)]
    cpu: bool,

    /// Sampling seed; taken from the clock when omitted
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Turn text into a WAV file
    Generate(GenerateArgs),
    /// Build a voice bundle from a recording and its transcript
    Clone(CloneArgs),
    /// List the voices found in a directory
    Voices {
        /// Directory of `.npz` voice bundles
        #[arg(long, default_value = "voices")]
        voices_dir: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct GenerateArgs {
    /// Text to be turned into audio
    #[arg(long)]
    text: String,

    /// Name of the output audio file
    #[arg(long, default_value = "bark_generation.wav")]
    output_filename: String,

    /// Directory to save the outputs
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Voice to condition on: a `.npz` path or a name under --voices-dir
    #[arg(long)]
    history_prompt: Option<String>,

    /// Directory of `.npz` voice bundles
    #[arg(long, default_value = "voices")]
    voices_dir: PathBuf,

    /// Generation temperature for text (1.0 more diverse, 0.0 more conservative)
    #[arg(long, default_value_t = 0.7)]
    text_temp: f64,

    /// Generation temperature for waveform (1.0 more diverse, 0.0 more conservative)
    #[arg(long, default_value_t = 0.7)]
    waveform_temp: f64,

    /// Only log warnings and errors
    #[arg(long)]
    silent: bool,

    /// Also save the full generation next to the audio for reuse as a voice
    #[arg(long)]
    output_full: bool,
}

#[derive(clap::Args, Debug)]
struct CloneArgs {
    /// Recording of the voice to clone
    #[arg(long)]
    audio: PathBuf,

    /// What is said in the recording
    #[arg(long)]
    transcript: String,

    /// Bundle destination; `.npz` is appended when missing
    #[arg(long)]
    dest: String,
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "debug"
    } else if matches!(&cli.command, Command::Generate(g) if g.silent) {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn pipeline(cli: &Cli) -> Result<GenerationPipeline> {
    let device = select_device(cli.cpu || force_cpu_from_env())?;
    let seed = cli.seed.unwrap_or_else(clock_seed);
    info!(device = ?device, seed, model_dir = %cli.model_dir.display(), "loading pipeline");
    let pipeline = load_pipeline(&cli.model_dir, &device, default_dtype(&device))
        .with_context(|| format!("loading models from {}", cli.model_dir.display()))?;
    Ok(pipeline.with_seed(seed))
}

fn generate(cli: &Cli, args: &GenerateArgs) -> Result<()> {
    let history = match &args.history_prompt {
        Some(voice) => {
            let library = VoiceLibrary::new(&args.voices_dir);
            let path = library.locate(voice).with_context(|| {
                format!("unknown voice `{voice}` (looked in {})", args.voices_dir.display())
            })?;
            Some(load_history_prompt(path)?)
        }
        None => None,
    };

    std::fs::create_dir_all(&args.output_dir)?;
    let mut pipeline = pipeline(cli)?;
    let out = pipeline.generate_audio(
        &args.text,
        history.as_ref().map(|h| h.as_history()),
        args.text_temp,
        args.waveform_temp,
        args.silent,
        args.output_full,
    )?;

    let output_path = args.output_dir.join(&args.output_filename);
    write_wav(&output_path, &out.waveform)?;
    if let Some(bundle) = &out.bundle {
        let bundle_path = full_generation_path(&output_path);
        bundle.save(&bundle_path)?;
        info!(path = %bundle_path.display(), "saved full generation");
    }
    println!("Done! Output audio file is saved at: '{}'", output_path.display());
    Ok(())
}

/// `out/clip.wav` → `out/clip.npz`.
fn full_generation_path(wav_path: &Path) -> PathBuf {
    wav_path.with_extension(bark_core::bundle::BUNDLE_EXTENSION)
}

fn clone(cli: &Cli, args: &CloneArgs) -> Result<()> {
    let mut pipeline = pipeline(cli)?;
    VoiceCloner::new(&mut pipeline).clone_voice(
        &args.audio,
        &args.transcript,
        &args.dest,
        &LogProgress,
    )?;
    println!("Saved voice bundle to '{}'", VoiceCloner::bundle_path(&args.dest).display());
    Ok(())
}

fn voices(voices_dir: &Path) -> Result<()> {
    let names = VoiceLibrary::new(voices_dir).list()?;
    if names.is_empty() {
        println!("No voices found in '{}'", voices_dir.display());
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Generate(args) => generate(cli, args),
        Command::Clone(args) => clone(cli, args),
        Command::Voices { voices_dir } => voices(voices_dir),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    if let Err(e) = run(&cli) {
        eprintln!("Oops, an error occurred: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_defaults() {
        let cli = Cli::try_parse_from(["bark", "generate", "--text", "Hello world."]).unwrap();
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.output_filename, "bark_generation.wav");
        assert_eq!(args.output_dir, PathBuf::from("."));
        assert_eq!(args.text_temp, 0.7);
        assert_eq!(args.waveform_temp, 0.7);
        assert!(!args.silent);
        assert!(!args.output_full);
        assert!(args.history_prompt.is_none());
        assert!(cli.seed.is_none());
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "bark",
            "clone",
            "--audio",
            "me.wav",
            "--transcript",
            "hi there",
            "--dest",
            "voices/me",
            "--cpu",
            "--seed",
            "7",
        ])
        .unwrap();
        assert!(cli.cpu);
        assert_eq!(cli.seed, Some(7));
        assert!(matches!(cli.command, Command::Clone(ref a) if a.dest == "voices/me"));
    }

    #[test]
    fn generate_requires_text() {
        assert!(Cli::try_parse_from(["bark", "generate"]).is_err());
    }

    #[test]
    fn full_generation_sits_next_to_the_wav() {
        assert_eq!(
            full_generation_path(Path::new("out/clip.wav")),
            PathBuf::from("out/clip.npz")
        );
    }
}
