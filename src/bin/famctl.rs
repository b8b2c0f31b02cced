use clap::{App, Arg, ArgMatches, SubCommand};
use famsvc::{error::FamError, Fam, FamOptions, Permission, Result, ServiceConfig};
use std::{path::PathBuf, time::Instant};

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("famctl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fabric-attached memory service control tool")
        .arg(
            Arg::with_name("backup_dir")
                .long("backup-dir")
                .value_name("DIR")
                .help("Directory holding backups")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("demo")
                .about("Run fenced bitwise updates through several contexts")
                .arg(
                    Arg::with_name("contexts")
                        .short("c")
                        .long("contexts")
                        .value_name("COUNT")
                        .help("Number of contexts to open")
                        .default_value("3")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("profile")
                        .long("profile")
                        .help("Print the service profile afterwards"),
                ),
        )
        .subcommand(
            SubCommand::with_name("backup")
                .about("Back up a freshly filled dataitem")
                .arg(
                    Arg::with_name("name")
                        .short("n")
                        .long("name")
                        .value_name("NAME")
                        .help("Backup name")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("size")
                        .short("s")
                        .long("size")
                        .value_name("SIZE")
                        .help("Dataitem size in bytes")
                        .default_value("4096")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("restore")
                .about("Restore a backup into a new dataitem and summarize it")
                .arg(
                    Arg::with_name("name")
                        .short("n")
                        .long("name")
                        .value_name("NAME")
                        .help("Backup name")
                        .required(true)
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("list")
                .about("List backups")
                .arg(
                    Arg::with_name("pattern")
                        .short("p")
                        .long("pattern")
                        .value_name("PATTERN")
                        .help("Name prefix, optionally ending in '*'")
                        .default_value("*")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("delete")
                .about("Delete a backup")
                .arg(
                    Arg::with_name("name")
                        .short("n")
                        .long("name")
                        .value_name("NAME")
                        .help("Backup name")
                        .required(true)
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("info").about("Show build information"))
        .get_matches();

    let options = options(&matches);
    match matches.subcommand() {
        ("demo", Some(demo_matches)) => run_demo(demo_matches, options),
        ("backup", Some(backup_matches)) => run_backup(backup_matches, options),
        ("restore", Some(restore_matches)) => run_restore(restore_matches, options),
        ("list", Some(list_matches)) => run_list(list_matches, options),
        ("delete", Some(delete_matches)) => run_delete(delete_matches, options),
        ("info", Some(_)) => show_info(),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn options(matches: &ArgMatches) -> FamOptions {
    let mut service = ServiceConfig::default();
    if let Some(dir) = matches.value_of("backup_dir") {
        service = service.with_backup_dir(PathBuf::from(dir));
    }
    FamOptions::default().with_service(service)
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| FamError::invalid_parameter(name, "missing value"))
}

fn parse_u64(matches: &ArgMatches, name: &str) -> Result<u64> {
    required(matches, name)?
        .parse()
        .map_err(|_| FamError::invalid_parameter(name, "expected an unsigned integer"))
}

fn run_demo(matches: &ArgMatches, options: FamOptions) -> Result<()> {
    let count = parse_u64(matches, "contexts")?.clamp(1, 63);
    let fam = Fam::initialize("famctl", options)?;

    let region = fam.create_region("famctl_demo", 64 * 1024, Permission::new(0o777))?;
    let item = fam.allocate(&region, 1024, Permission::new(0o777))?;
    println!(
        "Region {} ({}) with a {}-byte dataitem at offset {}",
        region.name(),
        region.region_id(),
        item.size(),
        item.offset()
    );

    let start = Instant::now();
    let contexts = (0..count)
        .map(|_| fam.context_open())
        .collect::<Result<Vec<_>>>()?;
    for (bit, context) in contexts.iter().enumerate() {
        context.or(&item, 0, 1u64 << bit)?;
    }
    fam.quiet()?;

    let word = fam.default_context().get(&item, 0, 8)?.wait()?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&word);
    println!(
        "Word after {} fenced OR(s): {:#x} in {:.2}ms",
        count,
        u64::from_le_bytes(raw),
        start.elapsed().as_secs_f64() * 1000.0
    );

    for context in &contexts {
        fam.context_close(context)?;
    }
    if matches.is_present("profile") {
        print!("{}", fam.service().dump_profile());
    }

    fam.deallocate(item)?;
    fam.destroy_region(&region)?;
    fam.finalize("famctl")
}

fn run_backup(matches: &ArgMatches, options: FamOptions) -> Result<()> {
    let name = required(matches, "name")?;
    let size = parse_u64(matches, "size")?;
    let fam = Fam::initialize("famctl", options)?;

    let region = fam.create_region("famctl_backup", size.max(1) * 2, Permission::new(0o700))?;
    let item = fam.allocate(&region, size, Permission::new(0o600))?;
    let pattern: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    fam.default_context().put(&item, 0, pattern)?.wait()?;

    fam.backup(&item, name, "famctl_item")?;
    let info = fam.backup_info(name)?;
    println!(
        "Backed up {} byte(s) to '{}' in {}-byte chunks",
        info.item_size, info.name, info.chunk_size
    );

    fam.destroy_region(&region)?;
    fam.finalize("famctl")
}

fn run_restore(matches: &ArgMatches, options: FamOptions) -> Result<()> {
    let name = required(matches, "name")?;
    let fam = Fam::initialize("famctl", options)?;
    let info = fam.backup_info(name)?;

    let region = fam.create_region(
        "famctl_restore",
        info.item_size.max(1) * 2,
        Permission::new(0o700),
    )?;
    let item = fam.allocate(&region, info.item_size, Permission::new(0o600))?;
    fam.restore(name, &item)?;

    let bytes = fam.default_context().get(&item, 0, info.item_size)?.wait()?;
    let checksum = bytes.iter().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u64));
    println!(
        "Restored '{}' ({} from dataitem '{}'): checksum {:#018x}",
        info.name,
        info.item_size,
        info.dataitem_name,
        checksum
    );

    fam.destroy_region(&region)?;
    fam.finalize("famctl")
}

fn run_list(matches: &ArgMatches, options: FamOptions) -> Result<()> {
    let pattern = required(matches, "pattern")?;
    let fam = Fam::initialize("famctl", options)?;
    let backups = fam.list_backups(pattern)?;
    if backups.is_empty() {
        println!("No backups found");
    } else {
        println!("Backups:");
        for info in backups {
            println!(
                "  - {} ({} bytes, mode {:o}, item '{}')",
                info.name, info.item_size, info.mode, info.dataitem_name
            );
        }
    }
    fam.finalize("famctl")
}

fn run_delete(matches: &ArgMatches, options: FamOptions) -> Result<()> {
    let name = required(matches, "name")?;
    let fam = Fam::initialize("famctl", options)?;
    fam.delete_backup(name)?;
    println!("Deleted backup '{}'", name);
    fam.finalize("famctl")
}

fn show_info() -> Result<()> {
    println!("famctl {}", famsvc::VERSION);
    println!("  Default alignment: {} bytes", famsvc::config::DEFAULT_ALIGNMENT);
    println!(
        "  Default backup chunk: {} bytes",
        famsvc::config::DEFAULT_BACKUP_CHUNK_SIZE
    );
    Ok(())
}
