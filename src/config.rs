use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Error, Formatter};
use std::path::{Path, PathBuf};

use crate::request::{SpawnRequest, StreamRedirection};
use subspawn_core::Slot;

// === Request file schema ===
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RequestFile {
    pub args: Vec<String>,
    #[serde(default)]
    pub executable: Option<String>,
    /// Relative paths resolve against the current directory, not the file's.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub close_fds: bool,
    #[serde(default)]
    pub stdin: StreamSpec,
    #[serde(default)]
    pub stdout: StreamSpec,
    #[serde(default)]
    pub stderr: StreamSpec,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StreamSpec {
    Keyword(Keyword),
    File(FileSpec),
    Fd(FdSpec),
}

impl Default for StreamSpec {
    fn default() -> Self {
        StreamSpec::Keyword(Keyword::Inherit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Keyword {
    Inherit,
    Pipe,
    /// stderr only: merge into stdout.
    Stdout,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FdSpec {
    pub fd: i64,
}

impl Display for RequestFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::result::Result<(), Error> {
        match toml::to_string(self) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => Err(Error),
        }
    }
}

impl RequestFile {
    fn spec(&self, slot: Slot) -> &StreamSpec {
        match slot {
            Slot::Stdin => &self.stdin,
            Slot::Stdout => &self.stdout,
            Slot::Stderr => &self.stderr,
        }
    }

    /// Build the library request this file describes.
    pub fn to_spawn_request(&self) -> Result<SpawnRequest<'static>> {
        let mut req = SpawnRequest::new(&self.args).close_fds(self.close_fds);
        if let Some(exe) = &self.executable {
            req = req.executable(exe);
        }
        if let Some(dir) = &self.cwd {
            req = req.cwd(dir);
        }
        for slot in Slot::ALL {
            let r = redirection(slot, self.spec(slot))?;
            req.set_redirection(slot, r);
        }
        Ok(req)
    }
}

fn redirection(slot: Slot, spec: &StreamSpec) -> Result<StreamRedirection<'static>> {
    Ok(match spec {
        StreamSpec::Keyword(Keyword::Inherit) => StreamRedirection::Inherit,
        StreamSpec::Keyword(Keyword::Pipe) => StreamRedirection::Pipe,
        StreamSpec::Keyword(Keyword::Stdout) => {
            if slot != Slot::Stderr {
                bail!("Request: '{slot}' cannot be redirected to \"stdout\"");
            }
            StreamRedirection::MergeToStdout
        }
        StreamSpec::File(FileSpec { file }) => StreamRedirection::file(file),
        StreamSpec::Fd(FdSpec { fd }) => StreamRedirection::Descriptor(raw_stdio(*fd)?),
    })
}

#[cfg(unix)]
fn raw_stdio(fd: i64) -> Result<crate::sys::RawStdio> {
    let fd = i32::try_from(fd).with_context(|| format!("Request: fd {fd} is out of range"))?;
    if fd < 0 {
        bail!("Request: fd must be non-negative, got {fd}");
    }
    Ok(fd)
}

#[cfg(windows)]
fn raw_stdio(handle: i64) -> Result<crate::sys::RawStdio> {
    let handle = isize::try_from(handle)
        .with_context(|| format!("Request: handle {handle} is out of range"))?;
    Ok(handle as crate::sys::RawStdio)
}

pub fn parse_request(bytes: &[u8]) -> Result<RequestFile> {
    if bytes.is_empty() || bytes.iter().all(|b| b.is_ascii_whitespace()) {
        bail!("Request file is empty");
    }

    let s = std::str::from_utf8(bytes).context("Request file is not valid UTF-8")?;

    let request: RequestFile = toml::from_str(s)
        .context("Request TOML is invalid or does not match the expected schema")?;

    if request.args.is_empty() {
        bail!("Request: 'args' must name at least the program");
    }
    if request.args[0].is_empty() && request.executable.is_none() {
        bail!("Request: 'args[0]' must be non-empty unless 'executable' is set");
    }

    Ok(request)
}

pub fn load_request(path: &Path) -> Result<RequestFile> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading request {}", path.display()))?;
    parse_request(&bytes).with_context(|| format!("parsing request {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_request_parses() {
        let req = parse_request(
            br#"
args = ["sh", "-c", "echo hi"]
executable = "/bin/sh"
cwd = "/tmp"
close_fds = true
stdin = { file = "in.txt" }
stdout = "pipe"
stderr = "stdout"
"#,
        )
        .unwrap();
        assert_eq!(req.args, ["sh", "-c", "echo hi"]);
        assert_eq!(req.executable.as_deref(), Some("/bin/sh"));
        assert!(req.close_fds);
        assert_eq!(
            req.stdin,
            StreamSpec::File(FileSpec {
                file: "in.txt".into()
            })
        );
        assert_eq!(req.stdout, StreamSpec::Keyword(Keyword::Pipe));
        assert_eq!(req.stderr, StreamSpec::Keyword(Keyword::Stdout));

        let spawn = req.to_spawn_request().unwrap();
        assert!(spawn.redirection(Slot::Stdout).is_pipe());
        assert!(matches!(
            spawn.redirection(Slot::Stderr),
            StreamRedirection::MergeToStdout
        ));
        assert!(spawn.get_close_fds());
    }

    #[test]
    fn streams_default_to_inherit() {
        let req = parse_request(br#"args = ["true"]"#).unwrap();
        assert_eq!(req.stdin, StreamSpec::default());
        assert!(!req.close_fds);
        let spawn = req.to_spawn_request().unwrap();
        for slot in Slot::ALL {
            assert!(matches!(spawn.redirection(slot), StreamRedirection::Inherit));
        }
    }

    #[test]
    fn empty_args_are_rejected() {
        let err = parse_request(b"args = []").unwrap_err();
        assert!(format!("{err:#}").contains("'args' must name"));
    }

    #[test]
    fn merge_keyword_only_applies_to_stderr() {
        let req = parse_request(
            br#"
args = ["true"]
stdout = "stdout"
"#,
        )
        .unwrap();
        let err = req.to_spawn_request().unwrap_err();
        assert!(err.to_string().contains("cannot be redirected"));
    }

    #[test]
    fn unknown_stream_keyword_is_a_schema_error() {
        let err = parse_request(
            br#"
args = ["true"]
stdin = "socket"
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("expected schema"));
    }

    #[cfg(unix)]
    #[test]
    fn negative_fd_is_rejected() {
        let req = parse_request(
            br#"
args = ["true"]
stdout = { fd = -1 }
"#,
        )
        .unwrap();
        assert!(req.to_spawn_request().is_err());
    }

    #[test]
    fn load_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("req.toml");
        let err = load_request(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("req.toml"));

        std::fs::write(&missing, "args = [\"echo\", \"x\"]\nstdout = \"pipe\"\n").unwrap();
        let req = load_request(&missing).unwrap();
        assert_eq!(req.args, ["echo", "x"]);
    }

    #[test]
    fn display_round_trips() {
        let req = parse_request(
            br#"
args = ["cat"]
stdin = { fd = 5 }
stdout = { file = "out.log" }
"#,
        )
        .unwrap();
        let again = parse_request(req.to_string().as_bytes()).unwrap();
        assert_eq!(again, req);
    }
}

#[cfg(test)]
mod prop {
    use super::*;
    use proptest::prelude::*;
    use proptest::{collection::vec, option, string::string_regex};

    // --- Strategies ---------------------------------------------------------

    fn s_arg() -> impl Strategy<Value = String> {
        string_regex("[a-zA-Z0-9 ._/-]{1,16}").unwrap()
    }

    fn s_stream() -> impl Strategy<Value = StreamSpec> {
        prop_oneof![
            Just(StreamSpec::Keyword(Keyword::Inherit)),
            Just(StreamSpec::Keyword(Keyword::Pipe)),
            string_regex("[a-z]{1,8}\\.txt")
                .unwrap()
                .prop_map(|f| StreamSpec::File(FileSpec { file: f.into() })),
            (3i64..1024).prop_map(|fd| StreamSpec::Fd(FdSpec { fd })),
        ]
    }

    fn s_request() -> impl Strategy<Value = RequestFile> {
        (
            vec(s_arg(), 1..6),
            option::of(string_regex("/[a-z]{1,8}/[a-z]{1,8}").unwrap()),
            any::<bool>(),
            s_stream(),
            s_stream(),
            s_stream(),
        )
            .prop_map(|(args, executable, close_fds, stdin, stdout, stderr)| RequestFile {
                args,
                executable,
                cwd: None,
                close_fds,
                stdin,
                stdout,
                stderr,
            })
    }

    // --- Properties ---------------------------------------------------------

    proptest! {
        #[test]
        fn parse_request_roundtrips_for_valid_inputs(r in s_request()) {
            let toml_str = toml::to_string(&r).expect("serialize to TOML");
            let parsed = parse_request(toml_str.as_bytes()).expect("parse_request");
            prop_assert_eq!(&parsed, &r);
            let spawn = parsed.to_spawn_request().expect("convert");
            prop_assert_eq!(spawn.get_args().len(), r.args.len());
        }
    }

    proptest! {
        #[test]
        fn parse_request_rejects_non_utf8_bytes(b in any::<Vec<u8>>().prop_filter("non-empty non-utf8", |v| {
            !v.is_empty() && std::str::from_utf8(v).is_err()
        })) {
            let err = parse_request(&b).expect_err("should reject non-UTF8");
            let msg = format!("{err:#}");
            prop_assert!(msg.contains("not valid UTF-8") || msg.contains("is empty"));
        }
    }

    proptest! {
        #[test]
        fn parse_request_rejects_whitespace_only(ws in "[ \\t\\n\\r]{1,64}") {
            let err = parse_request(ws.as_bytes()).expect_err("should reject whitespace-only");
            let msg = format!("{err:#}");
            prop_assert!(msg.contains("Request file is empty"));
        }
    }

    proptest! {
        #[test]
        fn parse_request_rejects_unknown_fields(r in s_request(), extra_key in string_regex("[a-zA-Z][a-zA-Z0-9_]{0,8}").unwrap()) {
            let known = ["args", "executable", "cwd", "close_fds", "stdin", "stdout", "stderr"];
            let extra = if known.contains(&extra_key.as_str()) {
                "extra_field".to_string()
            } else {
                extra_key
            };
            // Prepend so the key lands at the top level, ahead of any [table].
            let s = format!("{extra} = true\n{}", toml::to_string(&r).expect("serialize"));

            let err = parse_request(s.as_bytes()).expect_err("deny_unknown_fields should reject");
            let msg = format!("{err:#}");
            prop_assert!(msg.contains("unknown field") || msg.contains("expected schema"));
        }
    }
}
