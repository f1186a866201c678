use crate::command::{CommandFactory, ExecutableCommand, ExitCode, Placement};
use crate::env::Environment;
use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};
use log::warn;
use nix::libc;
use std::env;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Permission bits of files created by the shell: owner read/write/execute.
pub const CREATE_MODE: u32 = 0o700;

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process without replacing the process image.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Process the command has to run in.
    const PLACEMENT: Placement = Placement::Child;

    /// Canonical name of the command, e.g. "tee" or "cd".
    fn name() -> &'static str;

    /// Executes the command using provided IO streams and environment.
    ///
    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(
        self: Box<Self>,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        match T::execute(*self, stdin, stdout, env) {
            Ok(x) => Ok(x),
            Err(e) => {
                eprintln!("{}: {:#}", T::name(), e);
                Ok(1)
            }
        }
    }

    fn placement(&self) -> Placement {
        T::PLACEMENT
    }
}

/// Usage text or argument error produced by `argh` instead of a command.
struct InvalidArgs {
    output: String,
    is_error: bool,
    placement: Placement,
}

impl ExecutableCommand for InvalidArgs {
    fn execute(
        self: Box<Self>,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.is_error {
            eprintln!("{}", self.output);
            Ok(1)
        } else {
            writeln!(stdout, "{}", self.output)?;
            Ok(0)
        }
    }

    fn placement(&self) -> Placement {
        self.placement
    }
}

/// Factory allows creating instances of a builtin from its argument vector.
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>> {
        if name == T::name() {
            Some(match T::from_args(&[name], args) {
                Ok(cmd) => Box::new(cmd),
                Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                    output,
                    is_error: status.is_err(),
                    placement: T::PLACEMENT,
                }),
            })
        } else {
            None
        }
    }
}

/// Name to handler mapping consulted before falling back to external programs.
pub struct Builtins {
    factories: Vec<Box<dyn CommandFactory>>,
}

impl Builtins {
    /// Create a registry with a custom set of command factories.
    pub fn new(factories: Vec<Box<dyn CommandFactory>>) -> Self {
        Self { factories }
    }

    /// Look `name` up, parsing `args` for it. `None` means "not a builtin".
    pub fn create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>> {
        self.factories
            .iter()
            .find_map(|factory| factory.try_create(name, args))
    }
}

impl Default for Builtins {
    /// The shell's builtins: `exit` and `cd` run in the shell itself,
    /// `pwd`, `tee` and `du` run in the forked child.
    fn default() -> Self {
        Self::new(vec![
            Box::new(Factory::<Exit>::default()),
            Box::new(Factory::<Cd>::default()),
            Box::new(Factory::<Pwd>::default()),
            Box::new(Factory::<Tee>::default()),
            Box::new(Factory::<Du>::default()),
        ])
    }
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl BuiltinCommand for Pwd {
    fn name() -> &'static str {
        "pwd"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        writeln!(stdout, "{}", env.current_dir.to_string_lossy())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// If no target is provided, changes to the directory specified by the HOME environment variable.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory. Defaults to $HOME when omitted.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    const PLACEMENT: Placement = Placement::Shell;

    fn name() -> &'static str {
        "cd"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        let target = match &self.target {
            Some(t) => PathBuf::from(t),
            None => match env.get_var("HOME") {
                Some(home) => PathBuf::from(home),
                None => anyhow::bail!("no target and HOME not set"),
            },
        };

        if let Err(e) = env::set_current_dir(&target) {
            eprintln!("cd: {}: {}", target.display(), e);
            if matches!(
                e.raw_os_error(),
                Some(libc::ENOENT) | Some(libc::EACCES) | Some(libc::ENOTDIR)
            ) {
                return Ok(1);
            }
            env.exit_request = Some(1);
            return Ok(1);
        }

        env.current_dir = env::current_dir().context("can't read the new working directory")?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Exit the shell.
pub struct Exit {
    #[argh(positional, greedy)]
    /// ignored.
    pub _args: Vec<String>,
}

impl BuiltinCommand for Exit {
    const PLACEMENT: Placement = Placement::Shell;

    fn name() -> &'static str {
        "exit"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        env.exit_request = Some(0);
        Ok(0)
    }
}

/// Chunk size used by `tee` when copying standard input.
pub const READ_SIZE: usize = 512;

/// File under `$HOME` that `tee` appends a summary line to.
pub const TEE_LOG: &str = ".tee.log";

#[derive(FromArgs)]
/// Copy standard input to standard output and to every FILE.
pub struct Tee {
    #[argh(switch, short = 'a')]
    /// append to each FILE instead of truncating it.
    pub append: bool,

    #[argh(switch, short = 'h')]
    /// print this usage and do nothing else.
    pub show_help: bool,

    #[argh(positional)]
    /// output files.
    pub files: Vec<String>,
}

const TEE_USAGE: &str = "Usage: tee [-h] [-a] [FILE]...
\tCopy stdin to each FILE and to stdout
\tOptions:
\t-a Append to the end of each FILE
\t-h help
";

impl Tee {
    fn open(&self, path: &str) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).mode(CREATE_MODE);
        if self.append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        options.open(path)
    }
}

impl BuiltinCommand for Tee {
    fn name() -> &'static str {
        "tee"
    }

    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.show_help {
            write!(stdout, "{}", TEE_USAGE)?;
            return Ok(0);
        }

        // Files that fail to open are reported and skipped.
        let mut outputs: Vec<File> = Vec::new();
        for path in &self.files {
            match self.open(path) {
                Ok(file) => outputs.push(file),
                Err(e) => eprintln!("tee: {}: {}", path, e),
            }
        }

        let mut buf = [0u8; READ_SIZE];
        let mut total = 0usize;
        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    eprintln!("tee: read: {}", e);
                    break;
                }
            };
            total += n;
            if let Err(e) = stdout.write_all(&buf[..n]) {
                eprintln!("tee: write: {}", e);
            }
            for file in &mut outputs {
                if let Err(e) = file.write_all(&buf[..n]) {
                    eprintln!("tee: write: {}", e);
                }
            }
        }
        stdout.flush()?;

        for file in outputs {
            if let Err(e) = file.sync_all() {
                eprintln!("tee: fsync: {}", e);
            }
        }

        if let Err(e) = append_tee_log(env, total, self.files.len()) {
            warn!("tee: can't update {}: {:#}", TEE_LOG, e);
        }
        Ok(0)
    }
}

/// One summary line for the tee log.
pub fn tee_log_line(bytes: usize, files: usize) -> String {
    format!(
        "{}:PID {}:EUID {}:{} byte(s):{} file(s)\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        std::process::id(),
        nix::unistd::geteuid(),
        bytes,
        files
    )
}

fn append_tee_log(env: &Environment, bytes: usize, files: usize) -> Result<()> {
    let home = env.get_var("HOME").context("HOME not set")?;
    let path = Path::new(&home).join(TEE_LOG);
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(CREATE_MODE)
        .open(&path)
        .with_context(|| format!("can't open {}", path.display()))?;
    log.write_all(tee_log_line(bytes, files).as_bytes())?;
    Ok(())
}

#[derive(FromArgs)]
/// Print the size of each FILE, or the total size of the regular files under each DIRECTORY.
pub struct Du {
    #[argh(switch, short = 'b')]
    /// report the space allocated on disk (blocks * 512) instead of the file size.
    pub blocks: bool,

    #[argh(switch, short = 'v')]
    /// print every visited entry when processing a directory.
    pub verbose: bool,

    #[argh(option, short = 't', default = "0")]
    /// only count regular files bigger than SIZE bytes, or smaller than -SIZE bytes when negative.
    pub threshold: i64,

    #[argh(switch, short = 'h')]
    /// print this usage and do nothing else.
    pub show_help: bool,

    #[argh(positional)]
    /// files or directories; defaults to the current directory.
    pub paths: Vec<String>,
}

const DU_USAGE: &str = "Usage: du [-h] [-b] [-t SIZE] [-v] [FILE | DIRECTORY]...
For each file, print its size.
For each directory, print the total size of the files in it and in all its subdirectories.
\tOptions:
\t-b Print the space allocated on disk by the blocks of each file.
\t-t SIZE Only count files bigger than SIZE bytes, or smaller than -SIZE bytes
\t\tif SIZE is negative.
\t-v Print the size of every file when processing a directory.
\t-h help
Note: all sizes are in bytes.
";

impl Du {
    fn size_of(&self, meta: &Metadata) -> u64 {
        if self.blocks {
            meta.blocks() * 512
        } else {
            meta.len()
        }
    }

    /// Whether a regular file passes the `-t` filter.
    fn keeps(&self, meta: &Metadata) -> bool {
        size_passes(meta.len(), self.threshold)
    }

    fn directory_total(&self, root: &str, stdout: &mut dyn Write) -> Result<u64> {
        let mut total = 0;
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    eprintln!("du: {}", e);
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    eprintln!("du: {}", e);
                    continue;
                }
            };
            let regular = meta.is_file();
            if regular && !self.keeps(&meta) {
                continue;
            }

            if self.verbose {
                write!(
                    stdout,
                    "{}{}",
                    "\t".repeat(entry.depth()),
                    entry.path().display()
                )?;
            }
            if regular {
                let size = self.size_of(&meta);
                total += size;
                if self.verbose {
                    writeln!(stdout, ": {}", size)?;
                }
            } else if self.verbose {
                writeln!(stdout)?;
            }
        }
        Ok(total)
    }
}

/// The `-t` rule: positive keeps sizes above it, negative keeps sizes below
/// its absolute value, zero keeps everything.
pub fn size_passes(size: u64, threshold: i64) -> bool {
    match threshold {
        0 => true,
        t if t > 0 => size > t as u64,
        t => size < t.unsigned_abs(),
    }
}

impl BuiltinCommand for Du {
    fn name() -> &'static str {
        "du"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.show_help {
            write!(stdout, "{}", DU_USAGE)?;
            return Ok(0);
        }

        let paths = if self.paths.is_empty() {
            vec![".".to_string()]
        } else {
            self.paths.clone()
        };

        for path in &paths {
            let meta = fs::metadata(path).with_context(|| format!("stat {}", path))?;
            if meta.is_dir() {
                let total = self.directory_total(path, stdout)?;
                writeln!(stdout, "(D) {}: {}", path, total)?;
            } else if meta.is_file() && self.keeps(&meta) {
                writeln!(stdout, "(F) {}: {}", path, self.size_of(&meta))?;
            }
        }
        Ok(0)
    }
}
