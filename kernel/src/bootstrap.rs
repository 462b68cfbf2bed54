//! Phased boot orchestrator
//!
//! Boot runs as an ordered sequence of phases (`early_hw`, `memory`,
//! `drivers`, `services`, `optional`), each executing its registered
//! steps in ascending priority (stable within a priority). A mandatory
//! step failing is fatal with the phase and step named; an optional step
//! failing is a warning. The `no-demo` / `demo=off` command-line tokens
//! gate optional steps off entirely.
//!
//! Interrupt contract: interrupts stay off until the IDT-install step
//! flips them on at the end of the drivers phase; every later step runs
//! with interrupts enabled. The orchestrator never re-enters itself; the
//! final act hands the CPU to the scheduler and does not return.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use spin::Once;

use crate::arch::x86_64::{apic, gdt, idt, timer};
use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::{FrameAllocator, PageFrame, FRAME_ALLOCATOR};
use crate::mm::region::{RegionFlags, RegionTypeTag, REGION_MAP};
use crate::mm::{self, heap, HIGHER_HALF_BASE, PAGE_SIZE};
use crate::sched::{scheduler, task_management};
use crate::{fs, irq, serial, userspace, video, wheel};

/// Boot phases, in strict execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    EarlyHw,
    Memory,
    Drivers,
    Services,
    Optional,
}

const PHASE_ORDER: [BootPhase; 5] = [
    BootPhase::EarlyHw,
    BootPhase::Memory,
    BootPhase::Drivers,
    BootPhase::Services,
    BootPhase::Optional,
];

fn phase_name(phase: BootPhase) -> &'static str {
    match phase {
        BootPhase::EarlyHw => "early_hw",
        BootPhase::Memory => "memory",
        BootPhase::Drivers => "drivers",
        BootPhase::Services => "services",
        BootPhase::Optional => "optional",
    }
}

/// Step flag: failure is tolerated, and the `no-demo` gate skips the step
/// entirely.
pub const BOOT_STEP_OPTIONAL: u32 = 1 << 0;

type StepFn = fn() -> KernelResult<()>;

struct BootStep {
    phase: BootPhase,
    name: &'static str,
    priority: u8,
    flags: u32,
    func: StepFn,
}

/// The init registry. Order here is irrelevant; execution order is phase
/// then priority.
static STEPS: &[BootStep] = &[
    BootStep {
        phase: BootPhase::EarlyHw,
        name: "gdt",
        priority: 10,
        flags: 0,
        func: step_gdt,
    },
    BootStep {
        phase: BootPhase::EarlyHw,
        name: "boot options",
        priority: 20,
        flags: 0,
        func: step_boot_options,
    },
    BootStep {
        phase: BootPhase::Memory,
        name: "region map",
        priority: 10,
        flags: 0,
        func: step_region_map,
    },
    BootStep {
        phase: BootPhase::Memory,
        name: "frame allocator",
        priority: 20,
        flags: 0,
        func: step_frame_allocator,
    },
    BootStep {
        phase: BootPhase::Memory,
        name: "kernel page tables",
        priority: 30,
        flags: 0,
        func: step_kernel_paging,
    },
    BootStep {
        phase: BootPhase::Memory,
        name: "kernel heap",
        priority: 40,
        flags: 0,
        func: step_kernel_heap,
    },
    BootStep {
        phase: BootPhase::Memory,
        name: "higher half check",
        priority: 50,
        flags: 0,
        func: step_higher_half_check,
    },
    BootStep {
        phase: BootPhase::Drivers,
        name: "interrupt controllers",
        priority: 10,
        flags: 0,
        func: step_interrupt_controllers,
    },
    BootStep {
        phase: BootPhase::Drivers,
        name: "idt",
        priority: 20,
        flags: 0,
        func: step_idt,
    },
    BootStep {
        phase: BootPhase::Drivers,
        name: "pit timer",
        priority: 30,
        flags: 0,
        func: step_pit_timer,
    },
    BootStep {
        phase: BootPhase::Drivers,
        name: "framebuffer",
        priority: 40,
        flags: BOOT_STEP_OPTIONAL,
        func: step_framebuffer,
    },
    BootStep {
        phase: BootPhase::Services,
        name: "wheel of fate",
        priority: 10,
        flags: 0,
        func: step_wheel,
    },
    BootStep {
        phase: BootPhase::Services,
        name: "idle task",
        priority: 20,
        flags: 0,
        func: step_idle_task,
    },
    BootStep {
        phase: BootPhase::Services,
        name: "gatekeeper",
        priority: 30,
        flags: 0,
        func: step_gatekeeper,
    },
    BootStep {
        phase: BootPhase::Optional,
        name: "ramfs motd",
        priority: 10,
        flags: BOOT_STEP_OPTIONAL,
        func: step_ramfs_motd,
    },
    BootStep {
        phase: BootPhase::Optional,
        name: "boot report",
        priority: 20,
        flags: BOOT_STEP_OPTIONAL,
        func: step_boot_report,
    },
];

/// Firmware memory-map entry kinds as the orchestrator sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootRegionKind {
    Usable,
    Bootloader,
    Unknown,
}

pub const MAX_BOOT_REGIONS: usize = 64;

/// Everything the boot loader told us, copied out of its structures.
pub struct BootContext {
    pub hhdm_offset: u64,
    pub kernel_phys_base: u64,
    pub kernel_len: u64,
    pub regions: [(u64, u64, BootRegionKind); MAX_BOOT_REGIONS],
    pub region_count: usize,
    pub rsdp: Option<u64>,
    pub framebuffer: Option<video::FbInfo>,
}

/// Parsed command-line switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    pub debug: bool,
    pub optional_enabled: bool,
    pub video_enabled: bool,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            debug: false,
            optional_enabled: true,
            video_enabled: true,
        }
    }
}

/// Parse the kernel command line: space-separated tokens, unknown ones
/// ignored.
pub fn parse_cmdline(cmdline: &str) -> BootOptions {
    let mut opts = BootOptions::default();
    for token in cmdline.split_whitespace() {
        match token {
            "no-demo" => opts.optional_enabled = false,
            "video=off" => opts.video_enabled = false,
            _ => {
                if let Some(value) = token
                    .strip_prefix("boot.debug=")
                    .or_else(|| token.strip_prefix("bootdebug="))
                {
                    match value {
                        "on" | "1" | "true" => opts.debug = true,
                        "off" | "0" | "false" => opts.debug = false,
                        _ => {}
                    }
                } else if let Some(value) = token.strip_prefix("demo=") {
                    match value {
                        "on" | "enabled" => opts.optional_enabled = true,
                        "off" | "disabled" => opts.optional_enabled = false,
                        _ => {}
                    }
                }
            }
        }
    }
    opts
}

static BOOT_CONTEXT: Once<BootContext> = Once::new();
static BOOT_OPTIONS: Once<BootOptions> = Once::new();
static BOOT_ENTERED: AtomicBool = AtomicBool::new(false);

fn boot_context() -> KernelResult<&'static BootContext> {
    BOOT_CONTEXT.get().ok_or(KernelError::NotInitialized {
        subsystem: "boot context",
    })
}

fn boot_options() -> BootOptions {
    BOOT_OPTIONS.get().copied().unwrap_or_default()
}

/// Insertion sort: stable, allocation-free, and the step lists are tiny.
fn stable_sort_by_priority(items: &mut [(u8, usize)]) {
    for i in 1..items.len() {
        let mut j = i;
        while j > 0 && items[j - 1].0 > items[j].0 {
            items.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Run the boot sequence and hand the CPU to the scheduler. Never
/// returns, never re-enters.
pub fn run(ctx: BootContext, cmdline: Option<&str>) -> ! {
    if BOOT_ENTERED.swap(true, Ordering::SeqCst) {
        panic!("boot orchestrator re-entered");
    }

    serial::init();
    crate::log_service::init();
    let opts = parse_cmdline(cmdline.unwrap_or(""));
    crate::log_service::set_verbose(opts.debug);
    BOOT_OPTIONS.call_once(|| opts);
    BOOT_CONTEXT.call_once(|| ctx);

    info!("slopos booting ({} init steps)", STEPS.len());
    for phase in PHASE_ORDER {
        run_phase(phase, &opts);
    }

    info!("boot complete, starting scheduler");
    scheduler::scheduler_start();
}

fn run_phase(phase: BootPhase, opts: &BootOptions) {
    debug!("boot: phase {}", phase_name(phase));

    let mut ordered = [(0u8, 0usize); 64];
    let mut n = 0;
    for (idx, step) in STEPS.iter().enumerate() {
        if step.phase == phase {
            ordered[n] = (step.priority, idx);
            n += 1;
        }
    }
    stable_sort_by_priority(&mut ordered[..n]);

    for &(_, idx) in &ordered[..n] {
        let step = &STEPS[idx];
        let optional = step.flags & BOOT_STEP_OPTIONAL != 0;
        if optional && !opts.optional_enabled {
            info!("boot: skipping optional step '{}'", step.name);
            continue;
        }
        debug!("boot: step '{}'", step.name);
        match (step.func)() {
            Ok(()) => {}
            Err(e) if optional => {
                warn!("boot: optional step '{}' failed: {}", step.name, e);
            }
            Err(e) => {
                panic!(
                    "boot: phase {} step '{}' failed: {}",
                    phase_name(phase),
                    step.name,
                    e
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// early_hw
// ---------------------------------------------------------------------------

fn step_gdt() -> KernelResult<()> {
    gdt::init();
    Ok(())
}

fn step_boot_options() -> KernelResult<()> {
    let opts = boot_options();
    info!(
        "boot options: debug={} optional={} video={}",
        opts.debug, opts.optional_enabled, opts.video_enabled
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// memory
// ---------------------------------------------------------------------------

/// Build the canonical map: kernel-core reservations first, then the
/// firmware-usable enrollment. The boot protocol guarantees its usable
/// ranges exclude the kernel image and loader allocations.
fn step_region_map() -> KernelResult<()> {
    let ctx = boot_context()?;
    mm::set_hhdm_offset(ctx.hhdm_offset);

    let mut map = REGION_MAP.lock();
    map.reserve(
        ctx.kernel_phys_base,
        ctx.kernel_len,
        RegionTypeTag::KernelImage,
        RegionFlags::ALLOW_PHYS_TO_VIRT,
        "kernel image",
    );
    for &(base, len, kind) in &ctx.regions[..ctx.region_count] {
        match kind {
            BootRegionKind::Usable => {}
            BootRegionKind::Bootloader => map.reserve(
                base,
                len,
                RegionTypeTag::PageTables,
                RegionFlags::ALLOW_PHYS_TO_VIRT,
                "loader tables + boot stack",
            ),
            BootRegionKind::Unknown => map.reserve(
                base,
                len,
                RegionTypeTag::Unknown,
                RegionFlags::empty(),
                "firmware",
            ),
        }
    }
    if let Some(rsdp) = ctx.rsdp {
        map.reserve(
            rsdp,
            PAGE_SIZE as u64,
            RegionTypeTag::AcpiReclaim,
            RegionFlags::ALLOW_PHYS_TO_VIRT,
            "acpi rsdp",
        );
    }
    if let Some(fb) = ctx.framebuffer {
        map.reserve(
            fb.phys_base,
            fb.pitch * fb.height,
            RegionTypeTag::Framebuffer,
            RegionFlags::MMIO,
            "framebuffer",
        );
    }
    map.reserve(
        apic::lapic_base(),
        PAGE_SIZE as u64,
        RegionTypeTag::LapicMmio,
        RegionFlags::MMIO,
        "lapic mmio",
    );

    for &(base, len, kind) in &ctx.regions[..ctx.region_count] {
        if kind == BootRegionKind::Usable {
            map.add_usable(base, len, "ram");
        }
    }
    if !map.check_invariants() {
        return Err(KernelError::InvalidState {
            expected: "sorted disjoint map",
            actual: "inconsistent map",
        });
    }
    info!("canonical map: {} regions", map.count());
    Ok(())
}

/// Size the descriptor array, reserve it, rebuild the map's view, seed
/// the buddy allocator.
fn step_frame_allocator() -> KernelResult<()> {
    let ctx = boot_context()?;
    let (frame_count, meta_base, meta_bytes) = {
        let map = REGION_MAP.lock();
        let highest = map
            .highest_usable_frame()
            .ok_or(KernelError::ResourceExhausted {
                resource: "usable memory",
            })?;
        let frame_count = (highest + 1) as usize;
        let meta_bytes = FrameAllocator::metadata_bytes(frame_count) as u64;
        let meta_base = map
            .allocatable()
            .find(|(_, r)| r.len >= meta_bytes)
            .map(|(_, r)| r.base)
            .ok_or(KernelError::OutOfMemory {
                requested: meta_bytes as usize,
            })?;
        (frame_count, meta_base, meta_bytes)
    };

    let mut map = REGION_MAP.lock();
    map.reserve(
        meta_base,
        meta_bytes,
        RegionTypeTag::AllocatorMetadata,
        RegionFlags::EXCLUDE_ALLOCATORS | RegionFlags::ALLOW_PHYS_TO_VIRT,
        "frame descriptors",
    );

    let meta_virt = mm::phys_to_virt(meta_base).ok_or(KernelError::NotInitialized {
        subsystem: "hhdm",
    })?;
    let mut alloc = FRAME_ALLOCATOR.lock();
    // SAFETY: the descriptor range was just reserved out of the map and
    // is aliased by the HHDM; nothing else will touch it.
    unsafe {
        alloc.init(
            meta_virt as *mut PageFrame,
            frame_count,
            &map,
            ctx.hhdm_offset,
        );
    }
    info!(
        "frame allocator: {} of {} frames free",
        alloc.free_frame_count(),
        frame_count
    );
    Ok(())
}

fn step_kernel_paging() -> KernelResult<()> {
    #[cfg(target_os = "none")]
    {
        use crate::mm::page_table;
        let boot_pml4 = page_table::current_pml4();
        let kernel_pml4 = {
            let mut alloc = FRAME_ALLOCATOR.lock();
            page_table::kernel_dir_init(boot_pml4, &mut alloc)?
        };
        // SAFETY: the new directory aliases the loader's high half, which
        // maps the running kernel, its stack and the HHDM.
        unsafe { page_table::activate(kernel_pml4) };
        info!("kernel page directory at {:#x}", kernel_pml4);
    }
    Ok(())
}

fn step_kernel_heap() -> KernelResult<()> {
    heap::init()?;
    // The pages flanking the heap window stay unmapped; running into one
    // is an overflow, reported distinctly instead of as a plain fault.
    idt::register_guard_page(mm::KERNEL_HEAP_BASE - PAGE_SIZE as u64);
    idt::register_guard_page(mm::KERNEL_HEAP_BASE + mm::KERNEL_HEAP_MAX);
    let stats = heap::stats();
    info!("kernel heap: {} bytes mapped", stats.total_size);
    Ok(())
}

/// The kernel must still be executing from the higher half after the
/// directory switch.
fn step_higher_half_check() -> KernelResult<()> {
    let rip = crate::arch::x86_64::instruction_pointer();
    #[cfg(target_os = "none")]
    if rip < HIGHER_HALF_BASE {
        return Err(KernelError::InvalidAddress { addr: rip });
    }
    debug!("executing from {:#x}", rip);
    #[cfg(not(target_os = "none"))]
    let _ = (rip, HIGHER_HALF_BASE);
    Ok(())
}

// ---------------------------------------------------------------------------
// drivers
// ---------------------------------------------------------------------------

fn step_interrupt_controllers() -> KernelResult<()> {
    apic::init();
    apic::route_irq(apic::PIT_GSI, idt::IRQ_BASE_VECTOR);
    Ok(())
}

/// Interrupts come on here and stay on for the rest of boot.
fn step_idt() -> KernelResult<()> {
    idt::init();
    crate::sync::enable_interrupts();
    Ok(())
}

fn timer_irq_handler(_frame: &mut idt::TrapFrame) {
    timer::record_tick();
    scheduler::scheduler_timer_tick();
}

fn step_pit_timer() -> KernelResult<()> {
    irq::install_handler(0, timer_irq_handler)?;
    timer::init(timer::DEFAULT_HZ);
    Ok(())
}

fn step_framebuffer() -> KernelResult<()> {
    let ctx = boot_context()?;
    if !boot_options().video_enabled {
        info!("video disabled on the command line");
        return Ok(());
    }
    match ctx.framebuffer {
        Some(fb) => {
            video::init(fb);
            Ok(())
        }
        None => Err(KernelError::Unsupported {
            operation: "boot without framebuffer",
        }),
    }
}

// ---------------------------------------------------------------------------
// services
// ---------------------------------------------------------------------------

fn step_wheel() -> KernelResult<()> {
    wheel::seed(crate::arch::read_tsc());
    wheel::set_loss_threshold(100);
    Ok(())
}

fn step_idle_task() -> KernelResult<()> {
    let id = task_management::create_idle_task()?;
    debug!("idle task is {}", id);
    Ok(())
}

fn step_gatekeeper() -> KernelResult<()> {
    let id = userspace::spawn_gatekeeper()?;
    info!("gatekeeper task is {}", id);
    Ok(())
}

// ---------------------------------------------------------------------------
// optional
// ---------------------------------------------------------------------------

fn step_ramfs_motd() -> KernelResult<()> {
    let handle = fs::open("/motd", true)?;
    fs::write(handle, b"welcome to slopos; the house always wins\n")?;
    fs::close(handle)?;
    Ok(())
}

fn step_boot_report() -> KernelResult<()> {
    let (total, free) = {
        let alloc = FRAME_ALLOCATOR.lock();
        (alloc.total_usable_frames(), alloc.free_frame_count())
    };
    let heap_stats = heap::stats();
    let map_regions = REGION_MAP.lock().count();
    info!(
        "boot report: {} regions, {}/{} frames free, heap {}B/{}B used",
        map_regions, free, total, heap_stats.allocated_size, heap_stats.total_size
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_defaults() {
        let opts = parse_cmdline("");
        assert!(!opts.debug);
        assert!(opts.optional_enabled);
        assert!(opts.video_enabled);
    }

    #[test]
    fn test_cmdline_tokens() {
        let opts = parse_cmdline("boot.debug=on demo=off video=off");
        assert!(opts.debug);
        assert!(!opts.optional_enabled);
        assert!(!opts.video_enabled);

        let opts = parse_cmdline("bootdebug=on");
        assert!(opts.debug);

        let opts = parse_cmdline("no-demo boot.debug=false");
        assert!(!opts.optional_enabled);
        assert!(!opts.debug);

        let opts = parse_cmdline("demo=enabled boot.debug=1");
        assert!(opts.optional_enabled);
        assert!(opts.debug);
    }

    #[test]
    fn test_unknown_tokens_ignored() {
        let opts = parse_cmdline("quiet splash demo=banana boot.debug=maybe");
        assert_eq!(opts, BootOptions::default());
    }

    #[test]
    fn test_priority_sort_is_stable() {
        let mut items = [(5u8, 0usize), (1, 1), (5, 2), (1, 3), (0, 4)];
        stable_sort_by_priority(&mut items);
        assert_eq!(items, [(0, 4), (1, 1), (1, 3), (5, 0), (5, 2)]);
    }

    #[test]
    fn test_phase_order_is_strict() {
        assert_eq!(
            PHASE_ORDER,
            [
                BootPhase::EarlyHw,
                BootPhase::Memory,
                BootPhase::Drivers,
                BootPhase::Services,
                BootPhase::Optional,
            ]
        );
    }

    #[test]
    fn test_registry_fits_scratch_table() {
        assert!(STEPS.len() <= 64, "step registry outgrew the sort scratch");
    }
}
