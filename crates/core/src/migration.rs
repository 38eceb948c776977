//! Allow-listed migration and hook commands.
//!
//! Manifest migrations are written as shell-like command lines, but they are
//! never handed to a shell. Each line is tokenized, its first token is mapped
//! to one of a fixed set of [`Program`]s, and the remaining arguments are
//! checked by a per-subcommand builder that only admits whitelisted options.
//! Anything else is rejected and the agent skips it.

use std::fmt;
use std::path::{Component, Path};

/// Programs a manifest may invoke.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Program {
    Docker,
    DockerCompose,
    Sqlite3,
    Systemctl,
}

impl Program {
    /// Map a command's first token to a program.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "docker" => Some(Self::Docker),
            "docker-compose" => Some(Self::DockerCompose),
            "sqlite3" => Some(Self::Sqlite3),
            "systemctl" => Some(Self::Systemctl),
            _ => None,
        }
    }

    /// Token used in manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::DockerCompose => "docker-compose",
            Self::Sqlite3 => "sqlite3",
            Self::Systemctl => "systemctl",
        }
    }

    /// Binary actually executed. Compose runs as the `docker compose` plugin.
    pub fn executable(&self) -> &'static str {
        match self {
            Self::Docker | Self::DockerCompose => "docker",
            Self::Sqlite3 => "sqlite3",
            Self::Systemctl => "systemctl",
        }
    }

    fn allowed_subcommands(&self) -> &'static [&'static str] {
        match self {
            Self::Docker => &["exec", "pull", "volume"],
            Self::DockerCompose => &["exec", "run", "pull"],
            Self::Sqlite3 => &[],
            Self::Systemctl => &["start", "stop", "restart", "reload"],
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, shell-free command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationCommand {
    program: Program,
    args: Vec<String>,
}

impl MigrationCommand {
    /// Parse and validate one manifest command line.
    pub fn parse(line: &str) -> crate::Result<Self> {
        let mut tokens = tokenize(line)?.into_iter();
        let first = tokens
            .next()
            .ok_or_else(|| rejected(line, "empty command"))?;
        let program = Program::from_token(&first)
            .ok_or_else(|| rejected(line, &format!("{first:?} is not an allowed program")))?;
        let args: Vec<String> = tokens.collect();

        for arg in &args {
            if arg.chars().any(char::is_control) {
                return Err(rejected(line, "control characters in argument"));
            }
        }

        match program {
            Program::Docker | Program::DockerCompose => {
                build_subcommand(program, &args).map_err(|reason| rejected(line, &reason))?
            }
            Program::Systemctl => build_systemctl(&args).map_err(|reason| rejected(line, &reason))?,
            Program::Sqlite3 => build_sqlite(&args).map_err(|reason| rejected(line, &reason))?,
        }

        Ok(Self { program, args })
    }

    pub fn program(&self) -> Program {
        self.program
    }

    pub fn executable(&self) -> &'static str {
        self.program.executable()
    }

    /// Arguments as written in the manifest, after the program token.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Full argument vector passed to [`Program::executable`].
    ///
    /// Compose commands are pinned to `compose_file` when one is given.
    pub fn argv(&self, compose_file: Option<&Path>) -> Vec<String> {
        match self.program {
            Program::DockerCompose => {
                let mut argv = vec!["compose".to_string()];
                if let Some(file) = compose_file {
                    argv.push("-f".to_string());
                    argv.push(file.display().to_string());
                }
                argv.extend(self.args.iter().cloned());
                argv
            }
            _ => self.args.clone(),
        }
    }

    /// Database path for `sqlite3` commands.
    pub fn sqlite_database(&self) -> Option<&Path> {
        match self.program {
            Program::Sqlite3 => self.args.first().map(Path::new),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn rejected(line: &str, reason: &str) -> crate::Error {
    crate::Error::CommandRejected(format!("{line:?}: {reason}"))
}

/// An option a subcommand accepts before its container or service name.
#[derive(Clone, Copy)]
enum Opt {
    Switch(&'static str),
    Value(&'static str, fn(&str) -> bool),
}

impl Opt {
    fn name(&self) -> &'static str {
        match self {
            Self::Switch(name) | Self::Value(name, _) => name,
        }
    }
}

const EXEC_OPTS: &[Opt] = &[
    Opt::Switch("-i"),
    Opt::Switch("--interactive"),
    Opt::Value("-u", is_user),
    Opt::Value("--user", is_user),
    Opt::Value("-w", is_absolute_path),
    Opt::Value("--workdir", is_absolute_path),
    Opt::Value("-e", is_env_assignment),
    Opt::Value("--env", is_env_assignment),
];

const COMPOSE_EXEC_OPTS: &[Opt] = &[
    Opt::Switch("-T"),
    Opt::Switch("--no-TTY"),
    Opt::Value("-u", is_user),
    Opt::Value("--user", is_user),
    Opt::Value("-w", is_absolute_path),
    Opt::Value("--workdir", is_absolute_path),
    Opt::Value("-e", is_env_assignment),
    Opt::Value("--env", is_env_assignment),
];

const COMPOSE_RUN_OPTS: &[Opt] = &[
    Opt::Switch("--rm"),
    Opt::Switch("-T"),
    Opt::Switch("--no-TTY"),
    Opt::Switch("--no-deps"),
    Opt::Value("-u", is_user),
    Opt::Value("--user", is_user),
    Opt::Value("-w", is_absolute_path),
    Opt::Value("--workdir", is_absolute_path),
    Opt::Value("-e", is_env_assignment),
    Opt::Value("--env", is_env_assignment),
];

const COMPOSE_PULL_OPTS: &[Opt] = &[Opt::Switch("-q"), Opt::Switch("--quiet")];

/// Validate leading options against `allowed`; returns the index of the
/// first positional argument. `--flag=value` forms are not accepted.
fn check_options(context: &str, args: &[String], allowed: &[Opt]) -> Result<usize, String> {
    let mut i = 0;
    while let Some(arg) = args.get(i) {
        if !arg.starts_with('-') {
            break;
        }
        let opt = allowed
            .iter()
            .find(|opt| opt.name() == arg)
            .ok_or_else(|| format!("{context} option {arg} is not allowed"))?;
        match opt {
            Opt::Switch(_) => i += 1,
            Opt::Value(_, valid) => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| format!("{context} {arg} requires a value"))?;
                if !valid(value) {
                    return Err(format!("invalid value {value:?} for {context} {arg}"));
                }
                i += 2;
            }
        }
    }
    Ok(i)
}

/// Options, a container or service name, then the command run inside it.
fn check_targeted(
    context: &str,
    args: &[String],
    allowed: &[Opt],
    needs_command: bool,
) -> Result<(), String> {
    let at = check_options(context, args, allowed)?;
    let target = args
        .get(at)
        .ok_or_else(|| format!("{context} requires a container or service"))?;
    if !is_object_name(target) {
        return Err(format!("invalid container or service name {target:?}"));
    }
    if needs_command && args.len() == at + 1 {
        return Err(format!("{context} requires a command"));
    }
    Ok(())
}

fn build_subcommand(program: Program, args: &[String]) -> Result<(), String> {
    let (sub, rest) = args
        .split_first()
        .ok_or_else(|| format!("{program} requires a subcommand"))?;
    if !program.allowed_subcommands().contains(&sub.as_str()) {
        return Err(format!("{program} {sub} is not allowed"));
    }
    let context = format!("{program} {sub}");

    match (program, sub.as_str()) {
        (Program::Docker, "pull") => match rest {
            [image] if is_image_ref(image) => Ok(()),
            [image] => Err(format!("invalid image reference {image:?}")),
            _ => Err(format!("{context} takes exactly one image")),
        },
        (Program::Docker, "exec") => check_targeted(&context, rest, EXEC_OPTS, true),
        (Program::Docker, "volume") => match rest {
            [action, name] if action == "create" && is_object_name(name) => Ok(()),
            _ => Err(format!("{context} only supports `create <name>`")),
        },
        (Program::DockerCompose, "exec") => {
            check_targeted(&context, rest, COMPOSE_EXEC_OPTS, true)
        }
        (Program::DockerCompose, "run") => {
            check_targeted(&context, rest, COMPOSE_RUN_OPTS, false)
        }
        (Program::DockerCompose, "pull") => {
            let at = check_options(&context, rest, COMPOSE_PULL_OPTS)?;
            match rest[at..].iter().find(|name| !is_object_name(name)) {
                Some(name) => Err(format!("invalid service name {name:?}")),
                None => Ok(()),
            }
        }
        _ => Err(format!("{context} is not allowed")),
    }
}

fn build_systemctl(args: &[String]) -> Result<(), String> {
    let [action, unit] = args else {
        return Err("systemctl takes exactly an action and a unit".to_string());
    };
    if !Program::Systemctl
        .allowed_subcommands()
        .contains(&action.as_str())
    {
        return Err(format!("systemctl {action} is not allowed"));
    }
    if !is_unit_name(unit) {
        return Err(format!("invalid unit name {unit:?}"));
    }
    Ok(())
}

/// `sqlite3 <database> <sql>...`. Every argument after the database is a
/// statement: CLI options and dot-commands are refused, and the agent runs
/// sqlite3 in `-safe` mode on top of that.
fn build_sqlite(args: &[String]) -> Result<(), String> {
    let (database, statements) = args
        .split_first()
        .ok_or_else(|| "sqlite3 requires a database path".to_string())?;
    if database.starts_with('-') {
        return Err("sqlite3 options are not allowed".to_string());
    }
    let path = Path::new(database);
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err("database path may not contain '..'".to_string());
    }
    if statements.is_empty() {
        return Err("sqlite3 requires at least one statement".to_string());
    }
    for statement in statements {
        let statement = statement.trim_start();
        if statement.starts_with('.') {
            return Err("sqlite3 dot-commands are not allowed".to_string());
        }
        if statement.starts_with('-') {
            return Err("sqlite3 options are not allowed".to_string());
        }
        if statement.is_empty() {
            return Err("empty sqlite3 statement".to_string());
        }
    }
    Ok(())
}

fn is_object_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_image_ref(image: &str) -> bool {
    image.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '.' | '_' | '@' | '-'))
}

fn is_user(user: &str) -> bool {
    !user.is_empty()
        && !user.starts_with('-')
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':'))
}

fn is_absolute_path(path: &str) -> bool {
    let path = Path::new(path);
    path.is_absolute()
        && !path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

fn is_env_assignment(value: &str) -> bool {
    let Some((key, _)) = value.split_once('=') else {
        return false;
    };
    key.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_unit_name(unit: &str) -> bool {
    !unit.is_empty()
        && !unit.starts_with('-')
        && unit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | ':' | '-'))
}

/// Split a command line into tokens.
///
/// Supports single quotes (literal), double quotes (with `\"` and `\\`
/// escapes) and backslash escapes outside quotes. Unquoted shell operators
/// are rejected since nothing is ever run through a shell.
pub fn tokenize(line: &str) -> crate::Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(rejected(line, "unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(rejected(line, "unterminated double quote")),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(rejected(line, "unterminated double quote")),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err(rejected(line, "trailing backslash")),
                }
            }
            ';' | '|' | '&' | '<' | '>' | '`' | '$' | '(' | ')' => {
                return Err(rejected(line, &format!("shell operator {c:?} is not supported")));
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
