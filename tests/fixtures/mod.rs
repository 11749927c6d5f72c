//! Shell scripts standing in for the PDF24 command line tool.
//!
//! Each one understands `-outputFile <out> ... <input>` like the real tool.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

const PARSE_ARGS: &str = r#"out=""
while [ $# -gt 1 ]; do
  case "$1" in
    -outputFile) out="$2"; shift 2 ;;
    -language|-dpi) shift 2 ;;
    *) shift ;;
  esac
done
in="$1"
"#;

/// Copies input to output.
pub const COPY_TOOL: &str = r#"cp "$in" "$out"
"#;

/// Fails on any document whose name contains `corrupt`, copies the rest.
pub const PICKY_TOOL: &str = r#"case "$in" in
  *corrupt*) echo "cannot parse $in" >&2; exit 3 ;;
esac
cp "$in" "$out"
"#;

/// Exits cleanly without producing anything.
pub const SILENT_TOOL: &str = r#"echo "nothing to do"
"#;

/// Write an executable tool script with `body` into `dir`.
#[cfg(unix)]
pub fn install_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{PARSE_ARGS}{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
