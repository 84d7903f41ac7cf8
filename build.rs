// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn repo_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).required(true).help(help)
}

fn all_versions_arg() -> Arg {
    Arg::new("all_versions")
        .short('a')
        .long("all-versions")
        .action(ArgAction::SetTrue)
        .help("Copy every release, not just the highest")
}

fn build_cli() -> Command {
    Command::new("pkgpool")
        .version(env!("CARGO_PKG_VERSION"))
        .author("pkgpool Contributors")
        .about("Maintain eopkg binary repositories backed by a shared package pool")
        .subcommand_required(true)
        .arg(
            Arg::new("base_dir")
                .short('b')
                .long("base-dir")
                .value_name("PATH")
                .default_value("./repo")
                .global(true)
                .help("Base directory holding the pool, repositories and databases"),
        )
        .arg(
            Arg::new("metadata_tool")
                .long("metadata-tool")
                .value_name("PROGRAM")
                .default_value("eopkg-metadata")
                .global(true)
                .help("Program printing package metadata as JSON"),
        )
        .arg(
            Arg::new("delta_level")
                .long("delta-level")
                .value_name("LEVEL")
                .default_value("19")
                .global(true)
                .help("zstd level used when generating deltas"),
        )
        .subcommand(
            Command::new("create-repo")
                .about("Create a new repository")
                .arg(repo_arg("name", "Repository name")),
        )
        .subcommand(
            Command::new("remove-repo")
                .about("Remove a repository and release its pool references")
                .arg(repo_arg("name", "Repository name")),
        )
        .subcommand(
            Command::new("add")
                .about("Add package files to a repository")
                .arg(repo_arg("repo", "Repository name"))
                .arg(
                    Arg::new("packages")
                        .required(true)
                        .num_args(1..)
                        .help("Package files (.eopkg)"),
                ),
        )
        .subcommand(
            Command::new("remove-source")
                .about("Remove packages by source name (optionally pinned as name==release)")
                .arg(repo_arg("repo", "Repository name"))
                .arg(
                    Arg::new("sources")
                        .required(true)
                        .num_args(1..)
                        .help("Source names, e.g. nano or nano==5"),
                ),
        )
        .subcommand(
            Command::new("delta")
                .about("Regenerate deltas for a repository")
                .arg(repo_arg("repo", "Repository name")),
        )
        .subcommand(
            Command::new("clone")
                .about("Clone a repository into a new one")
                .arg(repo_arg("src", "Repository to clone"))
                .arg(repo_arg("dest", "New repository name"))
                .arg(all_versions_arg()),
        )
        .subcommand(
            Command::new("copy-source")
                .about("Copy sources from one repository to another")
                .arg(repo_arg("src", "Source repository"))
                .arg(repo_arg("dest", "Destination repository"))
                .arg(
                    Arg::new("sources")
                        .required(true)
                        .num_args(1..)
                        .help("Source names to copy"),
                )
                .arg(all_versions_arg()),
        )
        .subcommand(
            Command::new("pull")
                .about("Pull newer releases from an origin repository into a clone")
                .arg(repo_arg("clone", "Repository receiving updates"))
                .arg(repo_arg("origin", "Repository providing updates")),
        )
        .subcommand(Command::new("list-repos").about("List repositories"))
        .subcommand(
            Command::new("verify")
                .about("Check repositories against their databases and the pool")
                .arg(Arg::new("repo").help("Repository name (checks all if omitted)"))
                .arg(
                    Arg::new("checksums")
                        .long("checksums")
                        .action(ArgAction::SetTrue)
                        .help("Also verify recorded package checksums"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("pkgpool.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
