// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use num_traits::FromPrimitive;
use rustyline::error::ReadlineError;
use simplelog::{ConfigBuilder, LevelFilter, SimpleLogger};
use time::macros::format_description;

use wlftl::low_level::{SectorMeta, META_LEN};
use wlftl::{
    BlockDevice, BlockRange, BlockRegion, BlockUsage, Config, DeviceAttributes, DeviceInfo,
    PowerState, RawMeta, WearLeveling,
};

/// Drives a wear-leveled flash image stored in a file.
///
/// The image is the data area of every block, followed by a 16-byte
/// metadata record for every sector.
#[derive(Parser)]
struct Ftltool {
    #[clap(short, long, default_value_t = 512)]
    sector_size: u32,

    #[clap(short, long, default_value_t = 4096)]
    block_size: u32,

    /// Repeat for more log output.
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,

    image_file: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Creates a blank (all ones) image.
    Create {
        blocks: u32,
    },
    Info,
    Format,
    Write {
        #[clap(parse(try_from_str = parse_num))]
        addr: u32,
        data: String,
    },
    Fill {
        #[clap(parse(try_from_str = parse_num))]
        addr: u32,
        #[clap(parse(try_from_str = parse_num))]
        len: u32,
        #[clap(parse(try_from_str = parse_num))]
        value: u32,
    },
    Read {
        #[clap(parse(try_from_str = parse_num))]
        addr: u32,
        #[clap(parse(try_from_str = parse_num))]
        len: u32,
    },
    Erase {
        #[clap(parse(try_from_str = parse_num))]
        addr: u32,
    },
    /// Runs compaction, optionally for a single physical block.
    Compact {
        block: Option<u32>,
    },
    Census,
    /// Dumps the raw metadata of a physical block.
    Meta {
        block: u32,
    },
    /// Shows which physical address backs a virtual one.
    Resolve {
        #[clap(parse(try_from_str = parse_num))]
        addr: u32,
    },
    /// Passes a power state (0 off, 1 on, 2 standby) down to the image.
    Power {
        state: u8,
    },
    Shell,
}

/// One line typed at the shell.
#[derive(Parser)]
#[clap(no_binary_name = true)]
struct Line {
    #[clap(subcommand)]
    cmd: Cmd,
}

fn parse_num(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Ftltool::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();
    SimpleLogger::init(level, log_cfg).context("installing logger")?;

    if let Cmd::Create { blocks } = args.cmd {
        return FlashImage::create(&args.image_file, blocks, args.block_size, args.sector_size)
            .with_context(|| format!("creating image file {}", args.image_file.display()));
    }

    let img = FlashImage::open(&args.image_file, args.block_size, args.sector_size)
        .with_context(|| format!("opening image file {}", args.image_file.display()))?;
    let wl = WearLeveling::new(img, Config::default());
    ftl(wl.initialize()).context("mounting image")?;

    match args.cmd {
        Cmd::Shell => shell(&wl)?,
        cmd => run(&wl, cmd)?,
    }

    ftl(wl.uninitialize())
}

/// Converts a wear-leveling error, which can't carry `std::error::Error`
/// from a `no_std` crate, into something `anyhow` takes.
fn ftl<T>(r: Result<T, wlftl::Error<std::io::Error>>) -> anyhow::Result<T> {
    r.map_err(|e| anyhow!("{e}"))
}

fn run(wl: &WearLeveling<FlashImage>, cmd: Cmd) -> anyhow::Result<()> {
    match cmd {
        Cmd::Create { .. } => bail!("can't create an image that is already open"),
        Cmd::Shell => bail!("already in a shell"),
        Cmd::Info => {
            let info = wl.device_info();
            println!("{} bytes per sector", info.bytes_per_sector);
            println!("write {} us, erase {} us", info.max_sector_write_us, info.max_block_erase_us);
            for (i, r) in info.regions.iter().enumerate() {
                println!(
                    "region {i}: {:#x}, {} blocks of {} bytes",
                    r.start, r.num_blocks, r.bytes_per_block,
                );
            }
            if let Some((start, region, range)) = info.find_for_block_usage(BlockUsage::FileSystem) {
                println!("file system range {range} of region {region} starts at {start:#x}");
            }
            if let Some(geo) = wl.geometry() {
                println!(
                    "managing {} blocks, {} sectors each, {} bytes",
                    geo.block_count,
                    geo.sectors_per_block,
                    geo.size(),
                );
            }
        }
        Cmd::Format => {
            ftl(wl.format())?;
            println!("formatted");
        }
        Cmd::Write { addr, data } => {
            ftl(wl.write(addr, data.as_bytes(), true))?;
            println!("wrote {} bytes at {addr:#x}", data.len());
        }
        Cmd::Fill { addr, len, value } => {
            let value = u8::try_from(value).context("fill value must be a byte")?;
            ftl(wl.memset(addr, value, len))?;
        }
        Cmd::Read { addr, len } => {
            let mut buf = vec![0; len as usize];
            ftl(wl.read(addr, &mut buf))?;
            println!("{}", pretty_hex::pretty_hex(&buf));
        }
        Cmd::Erase { addr } => {
            ftl(wl.erase_block(addr))?;
            println!("erased (block will be reclaimed at next compaction)");
        }
        Cmd::Compact { block } => {
            ftl(wl.compact(block))?;
            print_census(wl)?;
        }
        Cmd::Census => print_census(wl)?,
        Cmd::Meta { block } => {
            let geo = wl.geometry().ok_or_else(|| anyhow!("not mounted"))?;
            if block >= geo.block_count {
                bail!("block {block} out of range");
            }
            for s in 0..geo.sectors_per_block {
                let raw = wl
                    .with_device(|img| img.sector_metadata(geo.sector_addr(block, s)))
                    .context("reading metadata")?;
                print_meta(s, &raw);
            }
        }
        Cmd::Power { state } => {
            let state = PowerState::from_u8(state).ok_or_else(|| anyhow!("no power state {state}"))?;
            wl.set_power_state(state);
        }
        Cmd::Resolve { addr } => {
            let phys = ftl(wl.physical_address(addr))?;
            let geo = wl.geometry().ok_or_else(|| anyhow!("not mounted"))?;
            println!(
                "{addr:#x} => {phys:#x} (block {}, sector {})",
                geo.block_index(phys),
                geo.sector_index(phys),
            );
        }
    }
    Ok(())
}

fn print_census(wl: &WearLeveling<FlashImage>) -> anyhow::Result<()> {
    let c = ftl(wl.census())?;
    println!(
        "free {} in use {} mapped {} replacements {} trash {} bad {} unformatted {}",
        c.free, c.in_use, c.mapped, c.replacements, c.trash, c.bad, c.unformatted,
    );
    Ok(())
}

fn print_meta(sector: u32, raw: &RawMeta) {
    let meta = SectorMeta::from_raw(raw);
    print!("{sector:3}: {:02x?} {:?}", raw, meta.sector_flags());
    if let Some(m) = meta.mapped_sector() {
        print!(" -> {m}");
    }
    if let Some(l) = meta.linked_sector() {
        print!(" => {l}");
    }
    println!();
    if sector == 0 {
        if meta.is_bad_block() {
            println!("     bad block");
            return;
        }
        println!(
            "     {:?} owner {:?} map {:?}",
            meta.block_flags(),
            meta.owner_link(),
            meta.block_map().current_target(),
        );
    }
}

fn shell(wl: &WearLeveling<FlashImage>) -> anyhow::Result<()> {
    let mut rl = rustyline::Editor::<()>::new()?;

    loop {
        match rl.readline("ftl> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                rl.add_history_entry(line.as_str());
                match Line::try_parse_from(line.split_whitespace()) {
                    Ok(parsed) => {
                        if let Err(e) = run(wl, parsed.cmd) {
                            println!("error: {e:#}");
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            Err(ReadlineError::Eof) => {
                println!("exiting.");
                break;
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(ReadlineError::Io(e)) => return Err(e.into()),
            Err(e) => {
                println!("unexpected error: {e:?}");
                break;
            }
        }
    }

    Ok(())
}

/// A file laid out as the data area followed by the metadata area.
/// Programming ANDs into what's already there, as NAND would.
struct FlashImage {
    file: RefCell<std::fs::File>,
    bytes_per_block: u32,
    bytes_per_sector: u32,
    block_count: u32,
}

impl FlashImage {
    fn create(path: &Path, blocks: u32, bytes_per_block: u32, bytes_per_sector: u32) -> anyhow::Result<()> {
        let len = image_len(blocks, bytes_per_block, bytes_per_sector)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let erased = vec![0xFF; bytes_per_block as usize];
        let mut left = len;
        while left > 0 {
            let n = u64::min(left, erased.len() as u64);
            file.write_all(&erased[..n as usize])?;
            left -= n;
        }
        println!("created {blocks} blocks ({len} bytes)");
        Ok(())
    }

    fn open(path: &Path, bytes_per_block: u32, bytes_per_sector: u32) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let per_block = image_len(1, bytes_per_block, bytes_per_sector)?;
        if file_len % per_block != 0 {
            bail!("file is not a whole number of blocks in length");
        }
        let block_count = u32::try_from(file_len / per_block).context("file too large")?;

        Ok(Self {
            file: file.into(),
            bytes_per_block,
            bytes_per_sector,
            block_count,
        })
    }

    fn data_len(&self) -> u64 {
        u64::from(self.block_count) * u64::from(self.bytes_per_block)
    }

    fn meta_offset(&self, sector_addr: u32) -> u64 {
        self.data_len() + u64::from(sector_addr / self.bytes_per_sector) * META_LEN as u64
    }

    fn read_at(&self, offset: u64, dest: &mut [u8]) -> std::io::Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dest)
    }

    fn program_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut old = vec![0; data.len()];
        self.read_at(offset, &mut old)?;
        for (o, d) in old.iter_mut().zip(data) {
            *o &= d;
        }
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&old)
    }

    fn check_range(&self, addr: u32, len: usize) -> std::io::Result<()> {
        if u64::from(addr) + len as u64 > self.data_len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{len} bytes at {addr:#x} run off the image"),
            ));
        }
        Ok(())
    }
}

fn image_len(blocks: u32, bytes_per_block: u32, bytes_per_sector: u32) -> anyhow::Result<u64> {
    if bytes_per_sector == 0 || bytes_per_block % bytes_per_sector != 0 {
        bail!("block size must be a whole number of sectors");
    }
    let sectors = u64::from(bytes_per_block / bytes_per_sector);
    Ok(u64::from(blocks) * (u64::from(bytes_per_block) + sectors * META_LEN as u64))
}

impl BlockDevice for FlashImage {
    type Error = std::io::Error;

    fn initialize(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<(), Self::Error> {
        self.file.borrow_mut().sync_all()
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            attributes: DeviceAttributes::default(),
            bytes_per_sector: self.bytes_per_sector,
            max_sector_write_us: self.max_sector_write_us(),
            max_block_erase_us: self.max_block_erase_us(),
            regions: vec![BlockRegion {
                start: 0,
                num_blocks: self.block_count,
                bytes_per_block: self.bytes_per_block,
                ranges: vec![BlockRange {
                    usage: BlockUsage::FileSystem,
                    start_block: 0,
                    end_block: self.block_count.saturating_sub(1),
                }],
            }],
        }
    }

    fn read(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        self.check_range(addr, dest.len())?;
        self.read_at(u64::from(addr), dest)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.check_range(addr, data.len())?;
        self.program_at(u64::from(addr), data)
    }

    fn sector_metadata(&self, sector_addr: u32) -> Result<RawMeta, Self::Error> {
        self.check_range(sector_addr, 1)?;
        let mut raw = [0; META_LEN];
        self.read_at(self.meta_offset(sector_addr), &mut raw)?;
        Ok(raw)
    }

    fn set_sector_metadata(&mut self, sector_addr: u32, meta: &RawMeta) -> Result<(), Self::Error> {
        self.check_range(sector_addr, 1)?;
        self.program_at(self.meta_offset(sector_addr), meta)
    }

    fn is_block_erased(&self, addr: u32, len: u32) -> Result<bool, Self::Error> {
        let mut buf = vec![0; len as usize];
        self.read(addr, &mut buf)?;
        Ok(buf.iter().all(|&b| b == 0xFF))
    }

    fn erase_block(&mut self, block_addr: u32) -> Result<(), Self::Error> {
        self.check_range(block_addr, self.bytes_per_block as usize)?;
        let sectors = (self.bytes_per_block / self.bytes_per_sector) as usize;
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(block_addr)))?;
        file.write_all(&vec![0xFF; self.bytes_per_block as usize])?;
        file.seek(SeekFrom::Start(self.meta_offset(block_addr)))?;
        file.write_all(&vec![0xFF; sectors * META_LEN])
    }

    fn set_power_state(&mut self, state: PowerState) {
        log::debug!("power state {:?} ignored by file image", state);
    }

    fn max_sector_write_us(&self) -> u32 {
        200
    }

    fn max_block_erase_us(&self) -> u32 {
        3000
    }
}
