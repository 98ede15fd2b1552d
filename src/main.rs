use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use upcxx_build::{utils, BuildError, Project, Result};

#[derive(Parser)]
#[command(name = "upcxx-build")]
#[command(about = "Memoizing build engine for UPC++/GASNet source trees", long_about = None)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Print the resolved C++ compiler command
    Cxx,
    /// Print the resolved C compiler command
    Cc,
    /// Print the non-system include closure of a source file
    Incs { src: PathBuf },
    /// Build a source file's object and print its path
    Obj { src: PathBuf },
    /// Build an executable from an entry source and print its path
    Exe { src: PathBuf },
    /// Build a static library from an entry source and print its library set
    Lib { src: PathBuf },
    /// Build and write the bin/include/lib tree under a path
    Install { src: PathBuf, path: PathBuf },
    /// Build an executable and exec it with the given arguments
    Run {
        src: PathBuf,
        #[arg(num_args = .., trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Build GASNet and print its library set
    Gasnet,
    /// Print the GASNet conduit in use
    GasnetConduit,
    /// Whether the given source links against GASNet
    RequiresGasnet { src: PathBuf },
    /// Whether the given source requires the UPC++ backend
    RequiresUpcxxBackend { src: PathBuf },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(|| PathBuf::from("."));
    if let Err(err) = dispatch(&root, cli.command) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn source_arg(src: &Path) -> Result<PathBuf> {
    utils::canonicalize(utils::absolutize(src)).map_err(Into::into)
}

fn dispatch(root: &Path, command: Command) -> Result<()> {
    let project = Project::new(root)?;
    match command {
        Command::Cxx => {
            let cxx = project.run_build(|cxt| async move { cxt.cxx().await })?;
            println!("{}", cxx.join(" "));
        }
        Command::Cc => {
            let cc = project.run_build(|cxt| async move { cxt.cc().await })?;
            println!("{}", cc.join(" "));
        }
        Command::Incs { src } => {
            let src = source_arg(&src)?;
            let incs = project.run_build(|cxt| async move { cxt.includes(&src).await })?;
            for inc in incs {
                println!("{}", inc.display());
            }
        }
        Command::Obj { src } => {
            let src = source_arg(&src)?;
            let obj = project.run_build(|cxt| async move { cxt.compile(&src).await })?;
            println!("{}", obj.display());
        }
        Command::Exe { src } => {
            let src = source_arg(&src)?;
            let exe = project.run_build(|cxt| async move { cxt.executable(&src).await })?;
            println!("{}", exe.display());
        }
        Command::Lib { src } => {
            let src = source_arg(&src)?;
            let libset = project.run_build(|cxt| async move { cxt.library(&src).await })?;
            println!("{}", serde_json::to_string_pretty(&libset)?);
        }
        Command::Install { src, path } => {
            let src = source_arg(&src)?;
            project.run_build(|cxt| async move { cxt.install(&src, &path).await })?;
        }
        Command::Run { src, args } => {
            let src = source_arg(&src)?;
            let exe = project.run_build(|cxt| async move { cxt.executable(&src).await })?;
            exec_replace(&exe, &args)?;
        }
        Command::Gasnet => {
            let libset = project.run_build(|cxt| async move { cxt.gasnet().await })?;
            println!("{}", serde_json::to_string_pretty(&libset)?);
        }
        Command::GasnetConduit => {
            let conduit = project.run_build(|cxt| async move { cxt.gasnet_conduit().await })?;
            println!("{conduit}");
        }
        Command::RequiresGasnet { src } => {
            let src = source_arg(&src)?;
            let ans = project.run_build(|cxt| async move { cxt.requires_gasnet(&src) })?;
            println!("{ans}");
        }
        Command::RequiresUpcxxBackend { src } => {
            let src = source_arg(&src)?;
            let ans = project.run_build(|cxt| async move { cxt.requires_upcxx_backend(&src) })?;
            println!("{ans}");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn exec_replace(exe: &Path, args: &[String]) -> Result<()> {
    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new(exe).args(args).exec();
    Err(BuildError::io(err, exe))
}

#[cfg(not(unix))]
fn exec_replace(exe: &Path, args: &[String]) -> Result<()> {
    let status = std::process::Command::new(exe)
        .args(args)
        .status()
        .map_err(|err| BuildError::io(err, exe))?;
    std::process::exit(status.code().unwrap_or(1));
}
