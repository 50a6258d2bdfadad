use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use mmc_core::auth::RpmbKey;
use mmc_core::ops::boot::{self, BootArea, BootBusConditions, IdleKind};
use mmc_core::ops::erase::{self, EraseKind};
use mmc_core::ops::ffu::{FfuMode, FfuOptions, FfuOutcome};
use mmc_core::ops::partition::{self, CommitMode, CommitOutcome, GpPartition};
use mmc_core::ops::rpmb::{self, RPMB_DATA_SIZE};
use mmc_core::ops::settings::{self, NativeSectorOutcome};
use mmc_core::ops::write_protect::{self, UserWpType};
use mmc_core::register::ExtCsd;
use mmc_core::session::{MmcSession, SessionConfig, load_firmware};
use mmc_core::transport::{MmcTransport, MockTransport};

#[derive(Parser, Debug)]
#[command(author, version, about = "eMMC configuration and maintenance tool", long_about = None)]
struct Args {
    /// Block device, e.g. /dev/mmcblk0
    #[arg(short, long, global = true)]
    device: Option<PathBuf>,

    /// Session configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Permit irreversible operations
    #[arg(long, global = true)]
    allow_dangerous: bool,

    /// Run against a simulated device
    #[arg(long, global = true)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// EXT_CSD register access
    #[command(subcommand)]
    Extcsd(ExtCsdCommand),
    /// Decode the CMD13 device status
    Status,
    /// Boot and user area write protection
    #[command(subcommand)]
    Writeprotect(WriteProtectCommand),
    /// Define a general purpose partition
    Gp {
        /// -y (commit), -n (dry run) or -c (chain)
        #[arg(allow_hyphen_values = true, value_parser = parse_commit_mode)]
        mode: CommitMode,
        length_kib: u64,
        /// 1 to 4
        partition: u8,
        /// Mark the partition enhanced
        #[arg(long)]
        enhanced: bool,
        /// Extended attribute nibble
        #[arg(long, default_value_t = 0)]
        ext_attribute: u8,
    },
    /// Define the enhanced user data area
    EnhArea {
        #[arg(allow_hyphen_values = true, value_parser = parse_commit_mode)]
        mode: CommitMode,
        start_kib: u32,
        length_kib: u64,
    },
    /// Enable write reliability for one partition
    WriteReliability {
        #[arg(allow_hyphen_values = true, value_parser = parse_commit_mode)]
        mode: CommitMode,
        /// 0 (user area) to 4
        partition: u8,
    },
    /// Select the boot partition
    Bootpart {
        /// 0 (disable), 1, 2 or 7 (user area)
        area: u8,
        /// Send boot acknowledge (0 or 1)
        ack: u8,
    },
    /// Set BOOT_BUS_CONDITIONS
    Bootbus {
        /// single_backward, single_hs or dual
        mode: String,
        /// x1 or retain
        reset: String,
        /// x1, x4 or x8
        width: String,
    },
    /// Permanently enable or disable the RST_n signal
    Hwreset {
        #[arg(action = clap::ArgAction::Set, value_parser = parse_switch)]
        state: bool,
    },
    /// Enable background operations
    Bkops {
        /// auto or manual
        mode: String,
    },
    /// Enable or disable the volatile cache
    Cache {
        #[arg(action = clap::ArgAction::Set, value_parser = parse_switch)]
        state: bool,
    },
    /// Start a sanitize operation
    Sanitize {
        /// Timeout in milliseconds
        timeout_ms: Option<u32>,
    },
    /// Erase a block range
    Erase {
        /// legacy, discard, secure-erase, secure-trim1, secure-trim2 or trim
        kind: String,
        #[arg(value_parser = parse_number)]
        start: u32,
        #[arg(value_parser = parse_number)]
        end: u32,
    },
    /// Replay protected memory block access
    #[command(subcommand)]
    Rpmb(RpmbCommand),
    /// Field firmware update
    Ffu {
        image: PathBuf,
        /// default, opt1, opt2, opt3 or opt4
        #[arg(long)]
        mode: Option<String>,
        /// Bytes per transfer
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Switch to 4KB native sectors
    Disable512b,
    /// Read the CMD56 vendor block
    GenCmd {
        #[arg(value_parser = parse_number, default_value_t = settings::GEN_CMD_READ_ARG)]
        arg: u32,
    },
    /// CMD0 soft reset
    Softreset,
    /// CMD0 pre-idle
    Preidle,
    /// Alternative boot read of the boot partition
    BootOp { output: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ExtCsdCommand {
    /// Dump the register page
    Read,
    /// Write one byte
    Write {
        #[arg(value_parser = parse_number)]
        index: u32,
        #[arg(value_parser = parse_number)]
        value: u32,
    },
}

#[derive(Subcommand, Debug)]
enum WriteProtectCommand {
    BootGet,
    BootSet {
        /// Lock permanently
        #[arg(short, long)]
        permanent: bool,
        /// 0 or 1; both when omitted
        partition: Option<u8>,
    },
    UserGet,
    UserSet {
        /// none, temp, pwron or perm
        kind: String,
        #[arg(value_parser = parse_number)]
        start: u32,
        #[arg(value_parser = parse_number)]
        blocks: u32,
    },
}

#[derive(Subcommand, Debug)]
enum RpmbCommand {
    /// Program the authentication key (one-time)
    WriteKey { key_file: PathBuf },
    ReadCounter,
    ReadBlock {
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        count: u32,
        output: PathBuf,
        /// Verify the frames with this key
        key_file: Option<PathBuf>,
    },
    WriteBlock {
        #[arg(value_parser = parse_number)]
        address: u32,
        /// Exactly 256 bytes
        data_file: PathBuf,
        key_file: PathBuf,
    },
}

fn parse_number(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {}: {}", s, e))
}

fn parse_commit_mode(s: &str) -> Result<CommitMode, String> {
    CommitMode::from_flag(s).ok_or_else(|| format!("expected -y, -n or -c, got {}", s))
}

fn parse_switch(s: &str) -> Result<bool, String> {
    match s {
        "enable" => Ok(true),
        "disable" => Ok(false),
        other => Err(format!("expected enable or disable, got {}", other)),
    }
}

fn read_key(path: &Path) -> Result<RpmbKey> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read key {}", path.display()))?;
    Ok(RpmbKey::from_slice(&bytes)?)
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if args.allow_dangerous {
        config.allow_dangerous = true;
    }
    Ok(config)
}

fn report_commit(outcome: CommitOutcome) -> Result<()> {
    match outcome {
        CommitOutcome::Committed => {
            println!("Setting OTP PARTITION_SETTING_COMPLETED!");
            println!("Device power cycle needed for settings to take effect.");
            Ok(())
        }
        CommitOutcome::Deferred => {
            println!("Device is not yet partitioned; more provisioning expected.");
            Ok(())
        }
        CommitOutcome::NotCommitted => bail!("Dry run: PARTITION_SETTING_COMPLETED was not set"),
    }
}

fn print_ext_csd(csd: &ExtCsd) {
    println!("Extended CSD rev 1.{} ({})", csd.revision().0, csd.revision());
    println!("Sector count: {}", csd.sector_count());
    println!("Partitioning support: 0x{:02x}", csd.partitioning_support());
    println!("Partition setting completed: {}", csd.partition_setting_completed());
    println!("Boot partition size: {} bytes", csd.boot_partition_size());
    println!("FFU supported modes: 0x{:02x}", csd.supported_modes());
    for (row, bytes) in csd.as_bytes().chunks(16).enumerate() {
        let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:03}: {}", row * 16, hex.join(" "));
    }
}

fn run<T: MmcTransport>(session: &MmcSession<T, mmc_core::TracingObserver>, command: Command) -> Result<()> {
    match command {
        Command::Extcsd(ExtCsdCommand::Read) => {
            let csd = session.execute("EXT_CSD read", |t| ExtCsd::read(t))?;
            print_ext_csd(&csd);
        }
        Command::Extcsd(ExtCsdCommand::Write { index, value }) => {
            let value = u8::try_from(value).map_err(|_| anyhow!("value 0x{:x} does not fit a byte", value))?;
            session.execute("EXT_CSD write", |t| settings::write_register(t, index as usize, value))?;
        }
        Command::Status => {
            let report = session.execute("Status", |t| settings::status(t))?;
            print!("{}", report);
        }
        Command::Writeprotect(WriteProtectCommand::BootGet) => {
            let status = session.execute("Boot write protection", |t| write_protect::boot_status(t))?;
            print!("{}", status);
        }
        Command::Writeprotect(WriteProtectCommand::BootSet { permanent, partition }) => {
            session.set_boot_write_protect(partition, permanent)?;
        }
        Command::Writeprotect(WriteProtectCommand::UserGet) => {
            let report = session.execute("User write protection", |t| write_protect::user_status(t))?;
            print!("{}", report);
        }
        Command::Writeprotect(WriteProtectCommand::UserSet { kind, start, blocks }) => {
            let kind = UserWpType::parse(&kind)
                .ok_or_else(|| anyhow!("Unknown write protect type {}; use none, temp, pwron or perm", kind))?;
            session.set_user_write_protect(kind, start, blocks)?;
        }
        Command::Gp {
            mode,
            length_kib,
            partition,
            enhanced,
            ext_attribute,
        } => {
            let gp = GpPartition {
                index: partition,
                length_kib,
                enhanced,
                ext_attribute,
            };
            let outcome = session.execute("GP partition", |t| partition::create_gp_partition(t, &gp, mode))?;
            report_commit(outcome)?;
        }
        Command::EnhArea {
            mode,
            start_kib,
            length_kib,
        } => {
            let outcome = session.execute("Enhanced area", |t| {
                partition::set_enhanced_area(t, start_kib, length_kib, mode)
            })?;
            report_commit(outcome)?;
        }
        Command::WriteReliability { mode, partition } => {
            let outcome = session.execute("Write reliability", |t| {
                partition::set_write_reliability(t, partition, mode)
            })?;
            report_commit(outcome)?;
        }
        Command::Bootpart { area, ack } => {
            let area = BootArea::from_number(area)?;
            session.execute("Boot partition", |t| boot::enable_boot_partition(t, area, ack != 0))?;
        }
        Command::Bootbus { mode, reset, width } => {
            let conditions = BootBusConditions {
                mode: mode.parse()?,
                reset: reset.parse()?,
                width: width.parse()?,
            };
            session.execute("Boot bus conditions", |t| boot::set_boot_bus_conditions(t, conditions))?;
        }
        Command::Hwreset { state } => {
            session.execute("Hardware reset", |t| settings::set_hw_reset(t, state))?;
        }
        Command::Bkops { mode } => {
            let mode: settings::BkopsMode = mode.parse()?;
            session.execute("BKOPS", |t| settings::enable_bkops(t, mode))?;
        }
        Command::Cache { state } => {
            session.execute("Cache", |t| settings::set_cache(t, state))?;
        }
        Command::Sanitize { timeout_ms } => {
            session.sanitize(timeout_ms)?;
        }
        Command::Erase { kind, start, end } => {
            let kind: EraseKind = kind.parse()?;
            session.execute("Erase", |t| erase::erase(t, kind, start, end))?;
        }
        Command::Rpmb(rpmb_command) => run_rpmb(session, rpmb_command)?,
        Command::Ffu {
            image,
            mode,
            chunk_size,
        } => {
            let image = load_firmware(&image)?;
            let defaults = session.config().ffu_options();
            let options = FfuOptions {
                mode: match mode {
                    Some(mode) => mode.parse::<FfuMode>()?,
                    None => defaults.mode,
                },
                chunk_size: chunk_size.unwrap_or(defaults.chunk_size),
            };
            let report = session.run_ffu(&image, Some(options))?;
            match report.outcome {
                FfuOutcome::Installed => println!("FFU finished successfully"),
                FfuOutcome::RebootRequired => {
                    println!("Please reboot to complete firmware installation (ffu update)")
                }
            }
        }
        Command::Disable512b => match session.execute("Disable 512B emulation", |t| settings::disable_512b_emulation(t))? {
            NativeSectorOutcome::Switched => println!("MMC disable 512B emulation successful. Now reset the device to switch to 4KB native sector mode."),
            NativeSectorOutcome::AlreadyNative => println!("MMC 512B emulation mode is already disabled; doing nothing."),
        },
        Command::GenCmd { arg } => {
            let data = session.execute("GEN_CMD read", |t| settings::general_command_read(t, arg))?;
            for (row, bytes) in data.chunks(16).enumerate() {
                let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                println!("{:03}: {}", row * 16, hex.join(" "));
            }
        }
        Command::Softreset => {
            session.execute("Soft reset", |t| {
                boot::go_idle(t, IdleKind::SoftReset);
                Ok(())
            })?;
        }
        Command::Preidle => {
            session.execute("Pre-idle", |t| {
                boot::go_idle(t, IdleKind::PreIdle);
                Ok(())
            })?;
        }
        Command::BootOp { output } => {
            let data = session.execute("Alternative boot", |t| boot::alternative_boot_read(t))?;
            std::fs::write(&output, &data).with_context(|| format!("Failed to write {}", output.display()))?;
            info!(bytes = data.len(), path = %output.display(), "Boot partition saved");
        }
    }
    Ok(())
}

fn run_rpmb<T: MmcTransport>(session: &MmcSession<T, mmc_core::TracingObserver>, command: RpmbCommand) -> Result<()> {
    match command {
        RpmbCommand::WriteKey { key_file } => {
            let key = read_key(&key_file)?;
            session.execute("RPMB write-key", |t| rpmb::write_key(t, &key))?;
        }
        RpmbCommand::ReadCounter => {
            let counter = session.execute("RPMB read-counter", |t| rpmb::read_counter(t))?;
            println!("Counter value: 0x{:08x}", counter);
        }
        RpmbCommand::ReadBlock {
            address,
            count,
            output,
            key_file,
        } => {
            let address = u16::try_from(address).map_err(|_| anyhow!("RPMB address {} out of range", address))?;
            let count = u16::try_from(count).map_err(|_| anyhow!("RPMB block count {} out of range", count))?;
            let key = key_file.as_deref().map(read_key).transpose()?;
            let data = session.execute("RPMB read-block", |t| rpmb::read_blocks(t, address, count, key.as_ref()))?;
            std::fs::write(&output, &data).with_context(|| format!("Failed to write {}", output.display()))?;
        }
        RpmbCommand::WriteBlock {
            address,
            data_file,
            key_file,
        } => {
            let address = u16::try_from(address).map_err(|_| anyhow!("RPMB address {} out of range", address))?;
            let bytes = std::fs::read(&data_file).with_context(|| format!("Failed to read {}", data_file.display()))?;
            let data: [u8; RPMB_DATA_SIZE] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("RPMB data must be {} bytes, got {}", RPMB_DATA_SIZE, bytes.len()))?;
            let key = read_key(&key_file)?;
            let counter = session.execute("RPMB write-block", |t| rpmb::write_block(t, address, &data, &key))?;
            info!(counter, "RPMB write counter advanced");
        }
    }
    Ok(())
}

fn dispatch(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    if args.simulate {
        warn!("Using a simulated device; nothing is sent to hardware");
        let session = MmcSession::new(MockTransport::new(), config);
        return run(&session, args.command);
    }

    let device = args
        .device
        .ok_or_else(|| anyhow!("--device is required unless --simulate is given"))?;
    open_and_run(&device, config, args.command)
}

#[cfg(target_os = "linux")]
fn open_and_run(device: &Path, config: SessionConfig, command: Command) -> Result<()> {
    let transport = mmc_core::IoctlTransport::open(device)
        .with_context(|| format!("Could not open device {}", device.display()))?;
    let session = MmcSession::new(transport, config);
    run(&session, command)
}

#[cfg(not(target_os = "linux"))]
fn open_and_run(device: &Path, _config: SessionConfig, _command: Command) -> Result<()> {
    bail!("Raw MMC access to {} needs Linux; use --simulate", device.display())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }

    if let Err(e) = dispatch(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x1F"), Ok(31));
        assert_eq!(parse_number("512"), Ok(512));
        assert!(parse_number("zz").is_err());
    }

    #[test]
    fn test_commit_flag_parses_with_hyphen() {
        let args = Args::try_parse_from(["mmc", "--simulate", "write-reliability", "-n", "0"]).unwrap();
        assert!(matches!(
            args.command,
            Command::WriteReliability {
                mode: CommitMode::DryRun,
                partition: 0
            }
        ));
    }

    #[test]
    fn test_simulated_commands_succeed() {
        for argv in [
            vec!["mmc", "--simulate", "status"],
            vec!["mmc", "--simulate", "extcsd", "write", "33", "1"],
            vec!["mmc", "--simulate", "cache", "enable"],
            vec!["mmc", "--simulate", "erase", "trim", "0", "0x1ff"],
            vec!["mmc", "--simulate", "writeprotect", "user-get"],
            vec!["mmc", "--simulate", "gp", "-y", "4096", "1"],
        ] {
            let args = Args::try_parse_from(argv.clone()).unwrap();
            assert!(dispatch(args).is_ok(), "{:?}", argv);
        }
    }

    #[test]
    fn test_dry_run_is_a_failure() {
        let args = Args::try_parse_from(["mmc", "--simulate", "write-reliability", "-n", "1"]).unwrap();
        assert!(dispatch(args).is_err());
    }

    #[test]
    fn test_device_required_without_simulation() {
        let args = Args::try_parse_from(["mmc", "status"]).unwrap();
        assert!(dispatch(args).is_err());
    }
}
