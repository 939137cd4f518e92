use std::io;

use cpu::config::parse_u64;
use cpu::context::EFLAGS_TRAP;
use cpu::host::sim::{RecordingService, SimHost, SparseMemory};
use cpu::thunk::THUNK_SIZE;
use cpu::{
    CpuConfig, GuestContext, GuestRegisters, Host, NativeContext, ThreadHandle, ThunkBuffer,
    Wow64Cpu, decode_thunk, logging,
};
use tracing::info;

const GUEST_ENTRY: u32 = 0x0040_1000;
const GUEST_STACK: u32 = 0x0012_ff00;
const FIRST_SYSCALL: u32 = 0x18;
/// Length of the `call [bop]` sequence the guest uses to enter the thunk.
const CALL_LEN: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    syscalls: u32,
    reset: bool,
    resume_addr: Option<u64>,
    dump_thunk: bool,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            syscalls: 3,
            reset: false,
            resume_addr: None,
            dump_thunk: false,
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    logging::init()?;

    let config = CpuConfig::from_env()?;
    let mut host = SimHost::new();
    if let Some(addr) = cli.resume_addr {
        host = host.with_resume_routine(addr);
    }
    let mut cpu = Wow64Cpu::with_config(host, config);
    cpu.initialize()?;
    let bop = cpu.bop_code().unwrap_or_default();
    info!("{} bop code at {bop:#x}", logging::category_thunk());

    if cli.dump_thunk {
        dump_thunk(cpu.host_mut().thunk_page().bytes());
    }

    let mut guest = GuestContext::default();
    cpu.get_context(ThreadHandle::CURRENT, &mut guest)?;
    guest.eip = GUEST_ENTRY;
    guest.esp = GUEST_STACK;
    cpu.set_context(ThreadHandle::CURRENT, &guest)?;

    let mut service = RecordingService::new().returning(0);
    let mut memory = SparseMemory::new();
    let frame = cpu.simulate(&mut service)?;
    let mut regs = GuestRegisters::from_context(&guest);
    frame.apply(&mut regs);
    info!(
        "{} entered guest at {:#x} esp={:#x} via {}",
        logging::category_reset(),
        frame.eip(),
        frame.esp(),
        logging::frame_label(&frame)
    );

    for index in 0..cli.syscalls {
        let number = FIRST_SYSCALL + index;
        let return_to = regs.eip.wrapping_add(CALL_LEN);
        regs.esp = regs.esp.wrapping_sub(4);
        memory.write_u32(regs.esp, return_to);
        regs.eax = number;

        let frame = cpu.enter_from_guest(&regs, &memory, &mut service)?;
        frame.apply(&mut regs);
        info!(
            "{} {number:#x} -> eax={:#x}, back at {:#x} via {}",
            logging::category_syscall(),
            regs.eax,
            regs.eip,
            logging::frame_label(&frame)
        );
    }

    if cli.reset {
        let mut native = NativeContext {
            rip: u64::from(regs.eip),
            rsp: u64::from(regs.esp),
            rax: u64::from(regs.eax),
            rbx: u64::from(regs.ebx),
            rbp: u64::from(regs.ebp),
            eflags: regs.eflags | EFLAGS_TRAP,
            seg_cs: regs.cs,
            ..NativeContext::default()
        };
        cpu.reset_to_consistent_state(&mut native)?;
        info!(
            "{} native frame redirected to {:#x} cs={:#x} rsp={:#x}",
            logging::category_reset(),
            native.rip,
            native.seg_cs,
            native.rsp
        );
        let frame = cpu.simulate(&mut service)?;
        frame.apply(&mut regs);
        info!(
            "{} resumed guest at {:#x} eflags={:#x} via {}",
            logging::category_reset(),
            regs.eip,
            regs.eflags,
            logging::frame_label(&frame)
        );
    }

    println!("bop code:      {bop:#010x}");
    println!("syscalls made: {}", service.calls().len());
    println!("guest eip:     {:#010x}", regs.eip);
    println!("guest esp:     {:#010x}", regs.esp);
    Ok(())
}

fn dump_thunk(bytes: &[u8]) {
    let code = &bytes[..THUNK_SIZE.min(bytes.len())];
    let rendered = code
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!("thunk: {rendered}");
    match decode_thunk(bytes) {
        Some(targets) => println!(
            "  far call via {:#x} -> {:04x}:{:#x}, jmp {:#x}",
            targets.far_pointer, targets.native_cs, targets.continue_at, targets.resume
        ),
        None => println!("  (not a transition thunk)"),
    }
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--syscalls" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --syscalls".to_string())?;
                cfg.syscalls = raw
                    .parse::<u32>()
                    .map_err(|_| format!("invalid --syscalls value '{raw}'"))?;
                index += 2;
            }
            "--reset" => {
                cfg.reset = true;
                index += 1;
            }
            "--resume-addr" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --resume-addr".to_string())?;
                let value =
                    parse_u64(raw).ok_or_else(|| format!("invalid --resume-addr value '{raw}'"))?;
                cfg.resume_addr = Some(value);
                index += 2;
            }
            "--dump-thunk" => {
                cfg.dump_thunk = true;
                index += 1;
            }
            value => {
                return Err(format!("unknown argument '{value}'"));
            }
        }
    }

    Ok(cfg)
}

fn print_usage() {
    println!("Usage:");
    println!("  wowcpu-sim [--syscalls <n>] [--reset] [--dump-thunk]");
    println!("  wowcpu-sim --resume-addr <hex> [--dump-thunk]");
    println!();
    println!("Environment:");
    println!("  WOWCPU_RESET_EFLAGS_CLEAR  eflags bits cleared on reset (default 0x40100)");
    println!("  WOWCPU_LOG_TRANSITIONS     log every mode change at debug level");
    println!("  RUST_LOG                   tracing filter (default info)");
}
