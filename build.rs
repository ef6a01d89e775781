// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: compose configuration file
fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("PATH")
        .default_value("/etc/treeforge/compose.toml")
        .help("Compose configuration")
}

fn treespec_arg() -> Arg {
    Arg::new("treespec").required(true).help("Treespec file")
}

fn build_cli() -> Command {
    Command::new("treeforge")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Treeforge Contributors")
        .about("Package cache and tree assembly engine")
        .subcommand_required(false)
        .subcommand(
            Command::new("init")
                .about("Create an empty object store")
                .arg(Arg::new("repo").required(true).help("Store directory")),
        )
        .subcommand(
            Command::new("compose")
                .about("Compose a treespec and publish it under its ref")
                .arg(treespec_arg())
                .arg(config_arg())
                .arg(
                    Arg::new("dry_run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Resolve and classify only"),
                ),
        )
        .subcommand(
            Command::new("index-repo")
                .about("Write the repodata.json index of a package directory")
                .arg(Arg::new("dir").required(true).help("Directory holding .rpm files"))
                .arg(
                    Arg::new("name")
                        .short('n')
                        .long("name")
                        .default_value("local")
                        .help("Repository name recorded in the index"),
                ),
        )
        .subcommand(
            Command::new("fingerprint")
                .about("Print the fingerprint a treespec resolves to")
                .arg(treespec_arg())
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("cache")
                .about("List cached packages and their state")
                .arg(config_arg()),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("treeforge.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
