//! Boot helpers shared by the integration tests

#![allow(dead_code)]

use chcore_kernel::{
    Badge, Cap, CapGroupArgs, CapRights, CpuId, Kernel, KernelConfig, Object, ObjectType, PmoKind,
    SimPlatform, VmPerm,
};
use std::sync::Arc;

pub struct Booted {
    pub kernel: Kernel,
    pub plat: Arc<SimPlatform>,
    pub root_group: Arc<Object>,
    pub root_thread: Arc<Object>,
}

pub fn boot(cpus: usize) -> Booted {
    let mut config = KernelConfig::default();
    config.sched.cpus = cpus;
    boot_with(config)
}

pub fn boot_with(config: KernelConfig) -> Booted {
    let plat = Arc::new(SimPlatform::default());
    let kernel = Kernel::new(config, plat.clone());
    let task = kernel
        .create_root_task(
            CapGroupArgs {
                name: "init".into(),
                badge: Badge(1),
                pid: 1,
            },
            0x40_0000,
        )
        .expect("root task");
    Booted {
        kernel,
        plat,
        root_group: task.group,
        root_thread: task.thread,
    }
}

/// Resolve `cap` in `group` without keeping a counted reference.
pub fn lookup(kernel: &Kernel, group: &Arc<Object>, cap: Cap, ty: ObjectType) -> Arc<Object> {
    kernel.obj_get(group, cap, ty).expect("lookup").arc().clone()
}

/// Create a group from the thread current on `cpu`; returns its cap and object.
pub fn spawn_group(kernel: &Kernel, cpu: CpuId, name: &str, badge: u64) -> (Cap, Arc<Object>) {
    let cap = kernel
        .sys_create_cap_group(
            cpu,
            CapGroupArgs {
                name: name.into(),
                badge: Badge(badge),
                pid: badge,
            },
        )
        .expect("create cap_group");
    let (_, current) = kernel.current_group(cpu).expect("current group");
    let group = lookup(kernel, &current, cap, ObjectType::CapGroup);
    (cap, group)
}

pub fn map_rw(kernel: &Kernel, cpu: CpuId, group_cap: Cap, va: u64, len: usize) {
    let pmo = kernel
        .sys_create_pmo(cpu, len, PmoKind::Anonymous, CapRights::ALL)
        .expect("create pmo");
    kernel
        .sys_map_pmo(cpu, group_cap, pmo, va, VmPerm::READ | VmPerm::WRITE, len)
        .expect("map pmo");
}

pub fn write_user(kernel: &Kernel, group: &Arc<Object>, va: u64, bytes: &[u8]) {
    let vm = kernel.group_vmspace(group).expect("vmspace");
    vm.as_vmspace().expect("vmspace body").copy_to_user(va, bytes).expect("copy_to_user");
}

pub fn read_user(kernel: &Kernel, group: &Arc<Object>, va: u64, len: usize) -> Vec<u8> {
    let vm = kernel.group_vmspace(group).expect("vmspace");
    vm.as_vmspace().expect("vmspace body").copy_from_user(va, len).expect("copy_from_user")
}

pub fn is_current(kernel: &Kernel, cpu: CpuId, thread: &Arc<Object>) -> bool {
    kernel
        .current_thread(cpu)
        .is_some_and(|current| Arc::ptr_eq(&current, thread))
}
