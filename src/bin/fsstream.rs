use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::executor::block_on;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fsstream::options::DEFAULT_CHUNK_SIZE;
use fsstream::{ReadStream, ReadStreamOptions, WriteStream, WriteStreamOptions};

#[derive(Parser, Debug)]
#[command(name = "fsstream", version, about = "copy and print files through async file streams")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy a file through a read stream into a write stream
    Copy {
        /// Path or file:// URL of the file to read
        #[arg(short = 'i', long = "input", value_name = "FILE")]
        input: PathBuf,
        /// Path or file:// URL of the file to write
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: PathBuf,
        /// Open flags for the output file (w, wx, a, ...)
        #[arg(long = "flags", default_value = "w")]
        flags: String,
        /// Permission bits for a created output file, in octal
        #[arg(long = "mode", value_parser = parse_mode, default_value = "666")]
        mode: u32,
        /// Bytes per read
        #[arg(long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Print a file to stdout
    Cat {
        /// Path or file:// URL of the file to read
        #[arg(short = 'i', long = "input", value_name = "FILE")]
        input: PathBuf,
        /// Bytes per read
        #[arg(long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    u32::from_str_radix(digits, 8).map_err(|e| format!("invalid octal mode {:?}: {}", s, e))
}

async fn copy(
    input: PathBuf,
    output: PathBuf,
    flags: &str,
    mode: u32,
    chunk_size: usize,
) -> anyhow::Result<()> {
    let reader = ReadStream::new(&input, ReadStreamOptions::new().with_chunk_size(chunk_size))?;
    let opts = WriteStreamOptions::new().with_flags(flags)?.with_mode(mode);
    let writer = WriteStream::new(&output, opts)?;

    let copied = async {
        while let Some(chunk) = reader
            .read_chunk()
            .await
            .with_context(|| format!("reading {}", input.display()))?
        {
            writer
                .write(chunk)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
        }
        anyhow::Ok(())
    }
    .await;

    if let Err(err) = copied {
        let _ = reader.destroy(None).await;
        let _ = writer.destroy(None).await;
        return Err(err);
    }
    writer
        .finish()
        .await
        .with_context(|| format!("closing {}", output.display()))?;
    info!(bytes = writer.bytes_written(), "copy complete");
    Ok(())
}

async fn cat(input: PathBuf, chunk_size: usize) -> anyhow::Result<()> {
    let reader = ReadStream::new(&input, ReadStreamOptions::new().with_chunk_size(chunk_size))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    while let Some(chunk) = reader
        .read_chunk()
        .await
        .with_context(|| format!("reading {}", input.display()))?
    {
        out.write_all(&chunk).context("writing to stdout")?;
    }
    out.flush().context("writing to stdout")?;
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_env("FSSTREAM_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Copy {
            input,
            output,
            flags,
            mode,
            chunk_size,
        }) => block_on(copy(input, output, &flags, mode, chunk_size)),
        Some(Commands::Cat { input, chunk_size }) => block_on(cat(input, chunk_size)),
        None => Err(anyhow::anyhow!(
            "command is required; use --help to see list of commands"
        )),
    };

    if let Err(err) = result {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
