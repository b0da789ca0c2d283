use std::path::PathBuf;

use clap::{builder::BoolishValueParser, Parser, Subcommand};
use zimage_core::config::Overrides;
use zimage_core::paths::PathOverrides;
use zimage_core::{
    LoraRequest, DEFAULT_HEIGHT, DEFAULT_LORA_STRENGTH, DEFAULT_PRECISION, DEFAULT_STEPS,
    DEFAULT_WIDTH,
};

/// Local text-to-image studio
#[derive(Parser, Debug)]
#[command(
    name = "zimage",
    version,
    about = "Local text-to-image studio: generate from the command line, serve the web API, or talk to agents over MCP"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        long,
        global = true,
        env = "Z_IMAGE_STUDIO_DATA_DIR",
        value_name = "DIR",
        help = "Directory holding the database and LoRA files"
    )]
    pub data_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "Z_IMAGE_STUDIO_OUTPUT_DIR",
        value_name = "DIR",
        help = "Directory generated images are written to"
    )]
    pub output_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Run on the CPU even when an accelerator is present")]
    pub cpu: bool,

    #[arg(
        long,
        global = true,
        env = "ZIMAGE_CUDA_REDUCED_PRECISION",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        help = "Allow reduced-precision accumulation in f16/bf16 CUDA matmuls"
    )]
    pub reduced_precision_gemm: Option<bool>,

    #[arg(
        long,
        global = true,
        env = "ZIMAGE_FORCE_DMMV",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        help = "Force the dequantize-mat-vec kernels for quantized CUDA matmuls"
    )]
    pub force_dmmv: Option<bool>,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Only log errors"
    )]
    pub quiet: bool,
}

impl CliArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            paths: PathOverrides {
                data_dir: self.data_dir.clone(),
                output_dir: self.output_dir.clone(),
            },
            cpu: self.cpu,
            reduced_precision_gemm: self.reduced_precision_gemm,
            force_dmmv: self.force_dmmv,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(visible_alias = "gen", about = "Generate one image from a prompt")]
    Generate(GenerateArgs),

    #[command(about = "Serve the HTTP API (and optionally the web UI)")]
    Serve(ServeArgs),

    #[command(about = "Show detected hardware and the precision tiers that fit")]
    Models,

    #[command(about = "Serve agent tools over MCP on stdin/stdout")]
    Mcp,

    #[command(subcommand, about = "Manage installed LoRA files")]
    Loras(LorasCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct GenerateArgs {
    #[arg(value_name = "PROMPT")]
    pub prompt: String,

    #[arg(
        short = 'o',
        long,
        value_name = "PATH",
        help = "Also copy the image to this path"
    )]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_STEPS)]
    pub steps: u32,

    #[arg(short = 'w', long, default_value_t = DEFAULT_WIDTH)]
    pub width: u32,

    #[arg(short = 'H', long, default_value_t = DEFAULT_HEIGHT)]
    pub height: u32,

    #[arg(long, help = "Random seed (random when omitted)")]
    pub seed: Option<u64>,

    #[arg(long, default_value = DEFAULT_PRECISION, help = "full, q8 or q4")]
    pub precision: String,

    #[arg(
        long = "lora",
        value_name = "FILE[:STRENGTH]",
        value_parser = parse_lora_spec,
        help = "Installed LoRA name or a .safetensors path; repeat up to four times"
    )]
    pub loras: Vec<LoraRequest>,

    #[arg(long, help = "Do not record this generation in history")]
    pub no_history: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    #[arg(long, value_name = "DIR", help = "Serve a web UI from this directory")]
    pub static_dir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "URL",
        help = "Base URL used in links handed to agents"
    )]
    pub public_url: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum LorasCommand {
    #[command(about = "List installed LoRA files")]
    List,
}

/// `name.safetensors` or `name.safetensors:0.8`. A suffix that is not a
/// number is part of the name.
pub fn parse_lora_spec(raw: &str) -> Result<LoraRequest, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("LoRA name must not be empty".to_string());
    }
    if let Some((name, strength)) = raw.rsplit_once(':') {
        if let Ok(strength) = strength.trim().parse::<f32>() {
            if name.is_empty() {
                return Err(format!("'{raw}' has a strength but no LoRA name"));
            }
            return Ok(LoraRequest {
                filename: name.to_string(),
                strength,
            });
        }
    }
    Ok(LoraRequest {
        filename: raw.to_string(),
        strength: DEFAULT_LORA_STRENGTH,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lora_spec() {
        let lora = parse_lora_spec("style.safetensors:0.6").unwrap();
        assert_eq!(lora.filename, "style.safetensors");
        assert_eq!(lora.strength, 0.6);

        let lora = parse_lora_spec("style.safetensors").unwrap();
        assert_eq!(lora.strength, DEFAULT_LORA_STRENGTH);

        let lora = parse_lora_spec("C:\\loras\\style.safetensors").unwrap();
        assert_eq!(lora.filename, "C:\\loras\\style.safetensors");

        assert!(parse_lora_spec(":0.5").is_err());
        assert!(parse_lora_spec("  ").is_err());
    }

    #[test]
    fn test_generate_defaults_and_alias() {
        let args = CliArgs::try_parse_from(["zimage", "gen", "a red fox"]).unwrap();
        let Commands::Generate(gen) = args.command else {
            panic!("expected generate");
        };
        assert_eq!(gen.steps, DEFAULT_STEPS);
        assert_eq!((gen.width, gen.height), (DEFAULT_WIDTH, DEFAULT_HEIGHT));
        assert_eq!(gen.precision, "q8");
        assert!(!gen.no_history);
    }

    #[test]
    fn test_generate_flags() {
        let args = CliArgs::try_parse_from([
            "zimage", "--cpu", "generate", "fox", "-w", "512", "-H", "768", "--seed", "7",
            "--lora", "a.safetensors:0.5", "--lora", "b.safetensors", "--no-history",
        ])
        .unwrap();
        assert!(args.cpu);
        assert!(args.overrides().cpu);
        let Commands::Generate(gen) = args.command else {
            panic!("expected generate");
        };
        assert_eq!((gen.width, gen.height, gen.seed), (512, 768, Some(7)));
        assert_eq!(gen.loras.len(), 2);
        assert_eq!(gen.loras[0].strength, 0.5);
        assert!(gen.no_history);
    }

    #[test]
    fn test_serve_defaults() {
        let args = CliArgs::try_parse_from(["zimage", "serve"]).unwrap();
        let Commands::Serve(serve) = args.command else {
            panic!("expected serve");
        };
        assert_eq!(serve.host, "0.0.0.0");
        assert_eq!(serve.port, 8000);
        assert!(serve.public_url.is_none());
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(CliArgs::try_parse_from(["zimage", "-v", "-q", "models"]).is_err());
        assert!(CliArgs::try_parse_from(["zimage", "loras", "list"]).is_ok());
    }
}
