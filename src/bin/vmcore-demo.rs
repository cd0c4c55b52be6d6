use std::sync::Arc;

use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use log::info;

use vmcore::address_space::AddressSpace;
use vmcore::arch::generic64::Generic64;
use vmcore::arch::{BlockSize, PageDescriptor, Permissions, Stage};
use vmcore::barrier::NullBarrier;
use vmcore::config::CoreConfig;
use vmcore::exception::{ExceptionInjector, FaultClass, InstrState};
use vmcore::pool::PageTablePool;
use vmcore::scheduler::Scheduler;
use vmcore::vcpu::{FeatureMask, VcpuContext};
use vmcore::vgic::VgicChipState;

fn verbosity_arg() -> Arg<'static, 'static> {
    Arg::with_name("verbose").short("v").long("verbose").help("Enable debug logging")
}

fn init_logging(args: &ArgMatches) {
    let level = if args.is_present("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run_mapping_demo(config: &CoreConfig) {
    let pool = Arc::new(PageTablePool::<Generic64>::new(
        0x1000_0000,
        config.initial_pool_tables,
        0x2000_0000,
        config.main_pool_tables,
    ));
    let barrier = Arc::new(NullBarrier::default());
    let space = AddressSpace::new(pool, Stage::Stage1, barrier).expect("bootstrap address space");

    let desc = PageDescriptor {
        input_addr: 0x0020_0000,
        output_addr: 0x8000_0000,
        size: BlockSize::Size2M,
        stage: Stage::Stage1,
        perms: Permissions::default(),
        asid_or_vmid: None,
    };
    space.map_page(desc).expect("map 2M region");
    info!("mapped ia={:#x} -> oa={:#x} size=2M", desc.input_addr, desc.output_addr);

    space.split_page(desc.input_addr).expect("split into 4K pages");
    let after_split = space.get_page(desc.input_addr).expect("still mapped after split");
    info!("after split: ia={:#x} now backed by {:?} leaves", desc.input_addr, after_split.size);

    space.unmap_page(desc.input_addr).expect("unmap");
    info!("unmapped ia={:#x}", desc.input_addr);
}

fn run_exception_demo() {
    let mut vcpu = VcpuContext::new(0, 0x410f_d0c1, 0x8100_0000, FeatureMask::empty());
    vcpu.pc = 0x8000_1000;
    let status = ExceptionInjector::inject(&mut vcpu, FaultClass::DataAbort, InstrState::A64, 0x9000_1000)
        .expect("inject data abort");
    info!(
        "injected data abort: elr={:#x} pc={:#x} fault_status={:#x}",
        vcpu.gpr[30], vcpu.pc, status.status_code
    );
}

fn run_vgic_demo(config: &CoreConfig) {
    let mut chip = VgicChipState::new(config.vcpus_per_guest);
    chip.distributor.set_trigger(42, vmcore::vgic::distributor::TriggerMode::Level);
    chip.distributor.set_target_cpus(42, 0b0001);
    chip.distributor.set_enabled(42, 0, true);
    let kicked = chip.distributor.assert_level(42, true, Some(0));
    info!("irq 42 asserted, kicked vcpus={:?}", kicked);
}

fn run_scheduler_demo(config: &CoreConfig) {
    let barrier = Arc::new(NullBarrier::default());
    let sched = Scheduler::new(0, barrier).expect("scheduler for host cpu 0");
    let mut a = VcpuContext::new(1, 0, 0, FeatureMask::empty());
    let mut b = VcpuContext::new(2, 0, 0, FeatureMask::empty());
    sched.switch(&mut a, &mut b);
    info!(
        "host cpu 0 now running vcpu {:?} of {} configured per guest",
        sched.running_vcpu(),
        config.vcpus_per_guest
    );
}

fn demo(args: &ArgMatches) {
    init_logging(args);
    let config = CoreConfig::default();
    run_mapping_demo(&config);
    run_exception_demo();
    run_vgic_demo(&config);
    run_scheduler_demo(&config);
}

fn main() {
    let demo_command = SubCommand::with_name("demo")
        .about("Run the stage-2 mapping, exception-injection, VGIC, and scheduler walkthroughs")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(verbosity_arg());

    let main_app = App::new("vmcore-demo")
        .about("Exercises vmcore's address-space, VCPU, and VGIC primitives end to end.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(demo_command);

    let matches = main_app.get_matches();
    match matches.subcommand() {
        ("demo", Some(sub_matches)) => demo(sub_matches),
        _ => unreachable!(),
    }
}
