use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;

use crate::context::Context;
use crate::error::{Error, IoResultExt, Result};

/// Quote one word for the shell. Plain words pass through untouched so the
/// rendered scripts stay readable.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"._-+/=:@%,".contains(&b));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
}

/// One process in the command tree.
///
/// The root is the producer; interior nodes consume a FIFO and fan their
/// output onward; leaves are plain files. `write_mode` propagates to every
/// descendant when the tree is rendered.
#[derive(Debug, Default)]
pub struct PipeNode {
    pub cmd: Vec<String>,
    pub stdout_files: Vec<PathBuf>,
    pub stdout_programs: Vec<PipeNode>,
    pub stderr_files: Vec<PathBuf>,
    pub stderr_programs: Vec<PipeNode>,
    pub write_mode: WriteMode,
}

impl PipeNode {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn add_stdout_file(&mut self, path: impl Into<PathBuf>) {
        self.stdout_files.push(path.into());
    }

    pub fn add_stdout_program(&mut self, node: PipeNode) {
        self.stdout_programs.push(node);
    }

    pub fn add_stderr_file(&mut self, path: impl Into<PathBuf>) {
        self.stderr_files.push(path.into());
    }

    pub fn add_stderr_program(&mut self, node: PipeNode) {
        self.stderr_programs.push(node);
    }

    /// Render the tree to a shell script multiplexing the root through
    /// named FIFOs. Every byte the root produces reaches every leaf, and
    /// the script returns only once every consumer has exited.
    pub fn render(self, fifo_dir: &Path, tee_program: &str) -> String {
        let mut renderer = Renderer {
            fifo_dir,
            tee_program,
            fifos: Vec::new(),
            consumers: Vec::new(),
        };

        let root = renderer.flatten(self, None);

        let mut lines = Vec::new();
        if !renderer.fifos.is_empty() {
            lines.push(format!("mkfifo {}", join_quoted(&renderer.fifos)));
        }
        for consumer in &renderer.consumers {
            lines.push(format!("{} &", renderer.command_line(consumer)));
        }
        lines.push(renderer.command_line(&root));
        lines.push("wait".to_string());
        if !renderer.fifos.is_empty() {
            lines.push(format!("rm -f {}", join_quoted(&renderer.fifos)));
        }

        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}

struct Flat {
    cmd: Vec<String>,
    input: Option<PathBuf>,
    stdout_sinks: Vec<PathBuf>,
    stderr_sink: Option<PathBuf>,
    append: bool,
}

struct Renderer<'a> {
    fifo_dir: &'a Path,
    tee_program: &'a str,
    fifos: Vec<PathBuf>,
    consumers: Vec<Flat>,
}

impl Renderer<'_> {
    fn next_fifo(&mut self) -> PathBuf {
        let fifo = self.fifo_dir.join(format!("fifo-{}", self.fifos.len()));
        self.fifos.push(fifo.clone());
        fifo
    }

    fn flatten(&mut self, node: PipeNode, input: Option<PathBuf>) -> Flat {
        let append = node.write_mode == WriteMode::Append;
        let mut stdout_sinks = node.stdout_files;
        let mut stderr_files = node.stderr_files;

        for mut child in node.stdout_programs {
            child.write_mode = node.write_mode;
            let fifo = self.next_fifo();
            stdout_sinks.push(fifo.clone());
            let flat = self.flatten(child, Some(fifo));
            self.consumers.push(flat);
        }

        for mut child in node.stderr_programs {
            child.write_mode = node.write_mode;
            let fifo = self.next_fifo();
            stderr_files.push(fifo.clone());
            let flat = self.flatten(child, Some(fifo));
            self.consumers.push(flat);
        }

        // Several stderr files need an auxiliary tee: the stream goes to a
        // FIFO and the tee fans it out.
        let stderr_sink = if stderr_files.len() >= 2 {
            let fifo = self.next_fifo();
            let mut cmd = vec![self.tee_program.to_string()];
            if append {
                cmd.push("-a".to_string());
            }
            let last = stderr_files.pop().expect("len checked above");
            cmd.extend(stderr_files.drain(..).map(|p| p.to_string_lossy().into_owned()));
            self.consumers.push(Flat {
                cmd,
                input: Some(fifo.clone()),
                stdout_sinks: vec![last],
                stderr_sink: None,
                append,
            });
            Some(fifo)
        } else {
            stderr_files.pop()
        };

        Flat {
            cmd: node.cmd,
            input,
            stdout_sinks,
            stderr_sink,
            append,
        }
    }

    fn command_line(&self, flat: &Flat) -> String {
        let gt = if flat.append { ">>" } else { ">" };
        let mut line = flat
            .cmd
            .iter()
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" ");

        if let Some(input) = &flat.input {
            line.push_str(&format!(" < {}", shell_quote(&input.to_string_lossy())));
        }
        if let Some(stderr) = &flat.stderr_sink {
            line.push_str(&format!(" 2{gt} {}", shell_quote(&stderr.to_string_lossy())));
        }

        match flat.stdout_sinks.split_last() {
            None => {}
            Some((only, [])) => {
                line.push_str(&format!(" {gt} {}", shell_quote(&only.to_string_lossy())));
            }
            Some((last, rest)) => {
                line.push_str(&format!(" | {}", shell_quote(self.tee_program)));
                if flat.append {
                    line.push_str(" -a");
                }
                for sink in rest {
                    line.push_str(&format!(" {}", shell_quote(&sink.to_string_lossy())));
                }
                line.push_str(&format!(" {gt} {}", shell_quote(&last.to_string_lossy())));
            }
        }

        line
    }
}

fn join_quoted(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| shell_quote(&p.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write the rendered script next to its FIFOs and run it under the
/// configured shell.
pub fn run_script(ctx: &Context, script: &str, dir: &Path) -> Result<()> {
    let path = dir.join("pipeline.sh");
    fs::write(&path, script).at(&path)?;
    debug!("running pipeline script {}:\n{script}", path.display());

    let shell = &ctx.backup_tools.shell_path;
    let out = Command::new(shell)
        .arg(&path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::external(shell, e.to_string()))?;
    if !out.status.success() {
        return Err(Error::external(
            format!("{shell} {}", path.display()),
            format!(
                "exit {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        ));
    }

    Ok(())
}
