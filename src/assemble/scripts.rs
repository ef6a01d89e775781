// src/assemble/scripts.rs

//! Script invocation points of an assembly
//!
//! Per-package scripts run in checkout order. Transaction file triggers
//! run once each, after every `%posttrans`, for triggers whose watched
//! prefixes match a file the transaction installed.

use crate::error::Result;
use crate::packages::{Nevra, PackageHeader, ScriptKind};
use crate::scriptlet::{ScriptInvocation, ScriptRunner};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Run the `kind` script of every package in `headers` that has one
pub fn run_package_scripts(
    runner: &dyn ScriptRunner,
    root: &Path,
    kind: ScriptKind,
    headers: &[&PackageHeader],
    upgrades: &HashSet<Nevra>,
) -> Result<usize> {
    let mut ran = 0;
    for header in headers {
        let Some(script) = header.script(kind) else {
            continue;
        };
        let invocation = ScriptInvocation {
            kind,
            package: &header.nevra,
            script,
            upgrade: upgrades.contains(&header.nevra),
            input: None,
        };
        runner
            .run_script(root, &invocation)
            .map_err(|e| e.context(format!("{} {}", header.nevra, kind)))?;
        ran += 1;
    }
    debug!("Ran {} {} scripts", ran, kind);
    Ok(ran)
}

/// Paths in `installed` under one of `prefixes`
fn matching_paths<'a>(prefixes: &[String], installed: &'a [String]) -> Vec<&'a str> {
    installed
        .iter()
        .filter(|p| {
            prefixes.iter().any(|prefix| {
                let prefix = prefix.trim_end_matches('/');
                p.as_str() == prefix
                    || p.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
            })
        })
        .map(String::as_str)
        .collect()
}

/// Run transaction file triggers of `headers` against the installed paths
///
/// Each trigger receives the matching paths on stdin, one per line.
pub fn run_file_triggers(
    runner: &dyn ScriptRunner,
    root: &Path,
    headers: &[&PackageHeader],
    installed: &[String],
) -> Result<usize> {
    let kind = ScriptKind::TransFileTriggerIn;
    let mut ran = 0;
    for header in headers {
        for script in header.scripts.iter().filter(|s| s.kind == kind) {
            let matched = matching_paths(&script.prefixes, installed);
            if matched.is_empty() {
                continue;
            }
            let mut input = matched.join("\n");
            input.push('\n');
            let invocation = ScriptInvocation {
                kind,
                package: &header.nevra,
                script,
                upgrade: false,
                input: Some(input),
            };
            runner
                .run_script(root, &invocation)
                .map_err(|e| e.context(format!("{} {}", header.nevra, kind)))?;
            ran += 1;
        }
    }
    debug!("Ran {} file triggers", ran);
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::packages::HeaderScript;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, ScriptKind, bool, Option<String>)>>,
        fail: Option<&'static str>,
    }

    impl ScriptRunner for Recorder {
        fn run_script(&self, _root: &Path, inv: &ScriptInvocation<'_>) -> Result<()> {
            if self.fail == Some(inv.package.name.as_str()) {
                return Err(Error::ScriptletError("exit 1".to_string()));
            }
            self.calls.lock().unwrap().push((
                inv.package.name.clone(),
                inv.kind,
                inv.upgrade,
                inv.input.clone(),
            ));
            Ok(())
        }

        fn run_command(&self, _root: &Path, _argv: &[String]) -> Result<()> {
            Ok(())
        }
    }

    fn header(name: &str, scripts: &[(ScriptKind, &[&str])]) -> PackageHeader {
        let mut h = PackageHeader::new(Nevra::new(name, 0, "1", "1", "noarch"));
        for (kind, prefixes) in scripts {
            h.scripts.push(HeaderScript {
                kind: *kind,
                interpreter: "/bin/sh".to_string(),
                body: "true".to_string(),
                prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            });
        }
        h
    }

    #[test]
    fn test_package_scripts_in_order() {
        let a = header("a", &[(ScriptKind::PostIn, &[])]);
        let b = header("b", &[(ScriptKind::PreIn, &[])]);
        let c = header("c", &[(ScriptKind::PostIn, &[])]);
        let upgrades: HashSet<Nevra> = [c.nevra.clone()].into_iter().collect();
        let runner = Recorder::default();

        let n = run_package_scripts(&runner, Path::new("/"), ScriptKind::PostIn, &[&a, &b, &c], &upgrades).unwrap();
        assert_eq!(n, 2);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0], ("a".to_string(), ScriptKind::PostIn, false, None));
        assert_eq!(calls[1], ("c".to_string(), ScriptKind::PostIn, true, None));
    }

    #[test]
    fn test_failing_script_names_package() {
        let a = header("a", &[(ScriptKind::PreIn, &[])]);
        let runner = Recorder {
            fail: Some("a"),
            ..Default::default()
        };
        let err = run_package_scripts(&runner, Path::new("/"), ScriptKind::PreIn, &[&a], &HashSet::new()).unwrap_err();
        assert!(err.to_string().contains("a-1-1.noarch %prein"));
    }

    #[test]
    fn test_file_triggers_get_matching_paths() {
        let ldconfig = header("glibc", &[(ScriptKind::TransFileTriggerIn, &["/usr/lib64/"])]);
        let fonts = header("fontconfig", &[(ScriptKind::TransFileTriggerIn, &["/usr/share/fonts"])]);
        let installed = vec![
            "/usr/lib64/libfoo.so.1".to_string(),
            "/usr/lib64x/other".to_string(),
            "/usr/bin/foo".to_string(),
        ];
        let runner = Recorder::default();
        let n = run_file_triggers(&runner, Path::new("/"), &[&ldconfig, &fonts], &installed).unwrap();
        assert_eq!(n, 1);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, "glibc");
        assert_eq!(calls[0].3.as_deref(), Some("/usr/lib64/libfoo.so.1\n"));
    }
}
