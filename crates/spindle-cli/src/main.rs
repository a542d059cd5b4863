//! Spindle CLI - list devices, check and run programs.

mod args;

use anyhow::{Context, Result};
use args::{HostArgument, format_value, result_arrays};
use clap::{Parser, Subcommand};
use spindle_core::Program;
use spindle_runtime::{
    Argument, ClientConfig, DeviceBuffer, DeviceClient, ExecutableBuildOptions, Output, Platform,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "spindle")]
#[command(about = "Run spindle programs on host and GPU devices", long_about = None)]
#[command(version)]
struct Cli {
    /// Backend to use: host or gpu
    #[arg(short, long, global = true, default_value = "host")]
    platform: Platform,

    /// Number of host devices to create
    #[arg(long, global = true, default_value = "1")]
    host_devices: usize,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the devices of a platform
    Devices,
    /// Parse, validate and compile a program
    Check {
        /// Path to the program text
        #[arg(value_name = "PROGRAM")]
        program: PathBuf,

        /// Compile as a portable executable
        #[arg(long)]
        portable: bool,
    },
    /// Compile and run a program
    Run {
        /// Path to the program text
        #[arg(value_name = "PROGRAM")]
        program: PathBuf,

        /// Positional argument as SHAPE=VALUES, e.g. f32[4]=1,2,3,4 (repeatable)
        #[arg(short, long = "arg", value_name = "SHAPE=VALUES")]
        args: Vec<String>,

        /// Run a portable executable on this device
        #[arg(short, long)]
        device: Option<usize>,

        /// Keep results on the device and read them back explicitly
        #[arg(long)]
        keep_on_device: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig {
        platform: cli.platform,
        ..ClientConfig::host(cli.host_devices)
    };

    match cli.command {
        Commands::Devices => cmd_devices(&config)?,
        Commands::Check { program, portable } => cmd_check(&config, &program, portable)?,
        Commands::Run {
            program,
            args,
            device,
            keep_on_device,
        } => cmd_run(&config, &program, &args, device, keep_on_device)?,
    }

    Ok(())
}

fn create_client(config: &ClientConfig) -> Result<DeviceClient> {
    DeviceClient::new(config)
        .with_context(|| format!("Failed to create {} client", config.platform))
}

fn load_program(path: &Path) -> Result<Program> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read program from {}", path.display()))?;
    Program::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Print every device of the configured platform.
fn cmd_devices(config: &ClientConfig) -> Result<()> {
    let client = create_client(config)?;
    println!("Platform: {}", client.platform());
    for device in client.devices() {
        println!("  [{}] {} ({})", device.id, device.name, device.kind);
    }
    Ok(())
}

/// Compile a program for its own parameter shapes and report the result.
fn cmd_check(config: &ClientConfig, path: &Path, portable: bool) -> Result<()> {
    let program = load_program(path)?;
    let parameters: Vec<_> = program.parameter_shapes().into_iter().cloned().collect();

    let client = create_client(config)?;
    let executable = client
        .compile(&program, &parameters, ExecutableBuildOptions::default(), portable)
        .with_context(|| format!("Failed to compile '{}'", program.name))?;

    println!("Program: {}", program.name);
    println!("  Instructions: {}", program.instructions.len());
    for (index, shape) in parameters.iter().enumerate() {
        println!("  Parameter {index}: {shape}");
    }
    println!("  Result: {}", program.result_shape()?);
    match executable.fingerprint() {
        Some(fingerprint) => println!("  Fingerprint: {fingerprint}"),
        None => println!("  Fingerprint: (none)"),
    }
    Ok(())
}

/// Run a program with command line arguments and print its results.
fn cmd_run(
    config: &ClientConfig,
    path: &Path,
    args: &[String],
    device: Option<usize>,
    keep_on_device: bool,
) -> Result<()> {
    let program = load_program(path)?;
    let arguments = args
        .iter()
        .map(|text| HostArgument::parse(text))
        .collect::<Result<Vec<_>>>()?;
    let argument_shapes: Vec<_> = arguments.iter().map(|arg| arg.shape.clone()).collect();

    let client = create_client(config)?;
    let executable = client
        .compile(
            &program,
            &argument_shapes,
            ExecutableBuildOptions::default(),
            device.is_some(),
        )
        .with_context(|| format!("Failed to compile '{}'", program.name))?;

    let mut materialized: Vec<DeviceBuffer> = Vec::new();
    let outputs = executable.run(
        &arguments
            .iter()
            .map(|arg| Argument::Host {
                data: &arg.data,
                shape: &arg.shape,
            })
            .collect::<Vec<_>>(),
        keep_on_device,
        device,
        &mut materialized,
    );
    for buffer in &materialized {
        buffer.deallocate()?;
    }
    let outputs = outputs.with_context(|| format!("Failed to run '{}'", program.name))?;

    let shapes = result_arrays(program.result_shape()?)?;
    for (index, (output, shape)) in outputs.into_iter().zip(&shapes).enumerate() {
        let line = match output {
            Output::Binary(data) => format_value(shape, data)?,
            Output::Buffer(buffer) => {
                let data = buffer.to_binary(None)?;
                let line = format!(
                    "{} (device {})",
                    format_value(shape, data)?,
                    buffer.device_id()
                );
                buffer.deallocate()?;
                line
            }
        };
        println!("Output {index}: {line}");
    }
    Ok(())
}
