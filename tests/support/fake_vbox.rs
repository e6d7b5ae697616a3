//! A recorded stand-in for the `VBoxManage` binary.
//!
//! The stand-in is a shell script in a temp dir that keeps catalog/running
//! state in plain files next to itself and appends every invocation to
//! `calls.log`, so lifecycle tests can run anywhere and assert on the exact
//! command lines the gateway produced.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use testbox::Vbox;

const SCRIPT: &str = r#"#!/usr/bin/env bash
set -u
STATE="$(cd "$(dirname "$0")" && pwd)"
echo "$@" >> "$STATE/calls.log"

vms="$STATE/vms"
running="$STATE/running"
info_dir="$STATE/info"

remove_line() { # file, exact line
    if [ -f "$1" ]; then
        grep -vx "$2" "$1" > "$1.tmp" || true
        mv "$1.tmp" "$1"
    fi
}

case "$1" in
  list)
    case "$2" in
      vms) file="$vms" ;;
      runningvms) file="$running" ;;
      *) echo "unknown list $2" >&2; exit 1 ;;
    esac
    if [ -f "$file" ]; then
      while IFS= read -r name; do
        [ -n "$name" ] && printf '"%s" {00000000-0000-0000-0000-000000000000}\n' "$name"
      done < "$file"
    fi
    ;;
  showvminfo)
    name="$2"
    if [ -f "$info_dir/$name" ]; then
      cat "$info_dir/$name"
    else
      echo "VBoxManage: error: Could not find a registered machine named '$name'" >&2
      exit 1
    fi
    ;;
  startvm)
    name="$2"
    grep -qx "$name" "$vms" 2>/dev/null || { echo "no such vm $name" >&2; exit 1; }
    grep -qx "$name" "$running" 2>/dev/null || echo "$name" >> "$running"
    ;;
  controlvm)
    name="$2"
    [ "$3" = poweroff ] || { echo "unknown control $3" >&2; exit 1; }
    remove_line "$running" "$name"
    ;;
  modifyvm)
    name="$2"; shift 2
    info="$info_dir/$name"
    touch "$info"
    while [ $# -gt 0 ]; do
      case "$1" in
        --natpf1)
          if [ "$2" = delete ]; then
            rule="$3"
            grep -v "^Forwarding(.*)=\"$rule," "$info" > "$info.tmp" || true
            mv "$info.tmp" "$info"
            shift 3
          else
            n=$(grep -c '^Forwarding(' "$info" || true)
            echo "Forwarding($n)=\"$2\"" >> "$info"
            shift 2
          fi
          ;;
        --cpus)
          grep -v '^cpus=' "$info" > "$info.tmp" || true
          mv "$info.tmp" "$info"
          echo "cpus=$2" >> "$info"
          shift 2
          ;;
        --memory)
          grep -v '^memory=' "$info" > "$info.tmp" || true
          mv "$info.tmp" "$info"
          echo "memory=$2" >> "$info"
          shift 2
          ;;
        *) shift ;;
      esac
    done
    ;;
  unregistervm)
    name="$2"
    remove_line "$vms" "$name"
    remove_line "$running" "$name"
    rm -f "$info_dir/$name"
    ;;
  import)
    echo 'Interpreting ova...'
    echo 'Suggested VM name "imported-box"'
    grep -qx imported-box "$vms" 2>/dev/null || echo imported-box >> "$vms"
    printf 'name="imported-box"\ncpus=1\nmemory=1024\n' > "$info_dir/imported-box"
    ;;
  export)
    : ;;
  *)
    echo "unknown command $1" >&2
    exit 2
    ;;
esac
"#;

pub struct FakeVbox {
    dir: tempfile::TempDir,
}

impl FakeVbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("VBoxManage");
        std::fs::write(&script, SCRIPT).expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        std::fs::create_dir(dir.path().join("info")).expect("mkdir info");
        std::fs::write(dir.path().join("vms"), "").expect("seed vms");
        std::fs::write(dir.path().join("running"), "").expect("seed running");
        Self { dir }
    }

    pub fn vbox(&self) -> Vbox {
        Vbox::with_command(self.dir.path().join("VBoxManage"))
    }

    pub fn add_vm(&self, name: &str) {
        self.append(&self.dir.path().join("vms"), name);
    }

    pub fn set_running(&self, name: &str) {
        self.append(&self.dir.path().join("running"), name);
    }

    pub fn write_info(&self, name: &str, contents: &str) {
        std::fs::write(self.dir.path().join("info").join(name), contents).expect("write info");
    }

    pub fn info(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join("info").join(name)).unwrap_or_default()
    }

    pub fn vms(&self) -> Vec<String> {
        self.lines(&self.dir.path().join("vms"))
    }

    pub fn running(&self) -> Vec<String> {
        self.lines(&self.dir.path().join("running"))
    }

    /// Every invocation the script has seen, one argv per line.
    pub fn calls(&self) -> Vec<String> {
        self.lines(&self.dir.path().join("calls.log"))
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    fn append(&self, file: &std::path::Path, line: &str) {
        let mut contents = std::fs::read_to_string(file).unwrap_or_default();
        contents.push_str(line);
        contents.push('\n');
        std::fs::write(file, contents).expect("append");
    }

    fn lines(&self, file: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(file)
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}
