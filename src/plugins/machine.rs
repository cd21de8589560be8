//! Virtual machine facade
//!
//! Guest memory access, address translation and per-CPU state. Register
//! and LBR snapshots are memoized within a stop; a continue-hook drops the
//! caches so the next stop re-reads them from the hypervisor.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::api::{Arch, CpuState, Hypervisor, LbrState, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::event::{ContinueHookId, EventManager};
use crate::plugins::{Plugin, RuntimeContext};
use crate::service::ServiceManager;

pub const NAME: &str = "VirtualMachine";

pub struct VirtualMachine {
    hv: Rc<dyn Hypervisor>,
    services: Rc<ServiceManager>,
    em: Rc<EventManager>,
    arch: Arch,
    cpus: RefCell<HashMap<u32, Rc<CpuState>>>,
    lbrs: RefCell<HashMap<u32, Rc<LbrState>>>,
    lbr_enabled: RefCell<Vec<u64>>,
    hook: Cell<Option<ContinueHookId>>,
}

impl VirtualMachine {
    pub fn load(ctx: &RuntimeContext) -> Result<Option<Rc<dyn Plugin>>> {
        let em = ctx.event_manager()?;
        let cpu_count = ctx.hypervisor.num_cpus() as usize;
        let vm = Rc::new(Self {
            hv: Rc::clone(&ctx.hypervisor),
            services: Rc::clone(&ctx.services),
            em: Rc::clone(&em),
            arch: ctx.arch,
            cpus: RefCell::new(HashMap::new()),
            lbrs: RefCell::new(HashMap::new()),
            lbr_enabled: RefCell::new(vec![0; cpu_count]),
            hook: Cell::new(None),
        });

        let hook_vm = Rc::clone(&vm);
        vm.hook
            .set(Some(em.add_continue_hook(move || hook_vm.invalidate_caches())));
        let service: Rc<dyn std::any::Any> = Rc::clone(&vm) as Rc<dyn std::any::Any>;
        ctx.services.register(NAME, service)?;
        Ok(Some(vm))
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn phys_mem_size(&self) -> u64 {
        self.hv.ram_size()
    }

    pub fn phys_mem_read(&self, gpa: u64, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.hv.read_phys_mem(gpa, &mut buf)?;
        Ok(buf)
    }

    pub fn phys_mem_write(&self, gpa: u64, data: &[u8]) -> Result<()> {
        self.hv.write_phys_mem(gpa, data)
    }

    pub fn cpu_count(&self) -> u32 {
        self.hv.num_cpus()
    }

    /// Register snapshot for a CPU, read from the hypervisor once per stop.
    pub fn cpu(&self, cpu: u32) -> Result<Rc<CpuState>> {
        if cpu >= self.cpu_count() {
            return Err(Error::InvalidRequest(format!(
                "this machine only has {} cpu(s)",
                self.cpu_count()
            )));
        }
        if let Some(state) = self.cpus.borrow().get(&cpu) {
            return Ok(Rc::clone(state));
        }
        let state = Rc::new(self.hv.cpu_state(cpu)?);
        self.cpus.borrow_mut().insert(cpu, Rc::clone(&state));
        Ok(state)
    }

    /// Translate a guest virtual address. An explicit `dtb` wins; otherwise
    /// the page table base of `cpu` (default 0) for this address is used.
    pub fn vtop(&self, gva: u64, dtb: Option<u64>, cpu: Option<u32>) -> Result<u64> {
        let dtb = match dtb {
            Some(dtb) => dtb,
            None => self.cpu(cpu.unwrap_or(0))?.page_table_base(gva),
        };
        self.hv.vtop(gva, dtb)
    }

    /// Read guest virtual memory, translating page by page.
    pub fn mem_read(
        &self,
        gva: u64,
        size: usize,
        dtb: Option<u64>,
        cpu: Option<u32>,
    ) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(size);
        let mut addr = gva;
        let mut remaining = size;
        while remaining > 0 {
            let page_off = addr & (PAGE_SIZE - 1);
            let chunk = ((PAGE_SIZE - page_off) as usize).min(remaining);
            let gpa = self.vtop(addr, dtb, cpu)?;
            let mut buf = vec![0u8; chunk];
            self.hv.read_phys_mem(gpa, &mut buf)?;
            data.extend_from_slice(&buf);
            addr += chunk as u64;
            remaining -= chunk;
        }
        Ok(data)
    }

    /// Write guest virtual memory, translating page by page.
    pub fn mem_write(
        &self,
        gva: u64,
        data: &[u8],
        dtb: Option<u64>,
        cpu: Option<u32>,
    ) -> Result<()> {
        let mut addr = gva;
        let mut offset = 0;
        while offset < data.len() {
            let page_off = addr & (PAGE_SIZE - 1);
            let chunk = ((PAGE_SIZE - page_off) as usize).min(data.len() - offset);
            let gpa = self.vtop(addr, dtb, cpu)?;
            self.hv.write_phys_mem(gpa, &data[offset..offset + chunk])?;
            addr += chunk as u64;
            offset += chunk;
        }
        Ok(())
    }

    /// Read a guest pointer; the width follows the execution mode of the
    /// CPU whose page tables are used.
    pub fn read_pointer(&self, gva: u64, dtb: Option<u64>, cpu: Option<u32>) -> Result<u64> {
        let width = self.cpu(cpu.unwrap_or(0))?.pointer_width();
        let data = self.mem_read(gva, width, dtb, cpu)?;
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&data);
        Ok(u64::from_le_bytes(bytes))
    }

    fn check_lbr_supported(&self) -> Result<()> {
        if self.arch != Arch::X86_64 {
            return Err(Error::Feature(
                "LBR is only available on x86-64".to_string(),
            ));
        }
        Ok(())
    }

    /// Take an LBR reference for one CPU, or all of them. The hypervisor
    /// is only toggled when a counter transitions from zero.
    pub fn lbr_enable(&self, cpu: Option<u32>) -> Result<()> {
        self.check_lbr_supported()?;
        let mut enable = false;
        {
            let mut counters = self.lbr_enabled.borrow_mut();
            match cpu {
                None => {
                    for counter in counters.iter_mut() {
                        *counter += 1;
                        if *counter == 1 {
                            enable = true;
                        }
                    }
                }
                Some(cpu) => {
                    let counter = counters
                        .get_mut(cpu as usize)
                        .ok_or_else(|| Error::InvalidRequest(format!("no cpu {cpu}")))?;
                    *counter += 1;
                    enable = *counter == 1;
                }
            }
        }
        if enable {
            self.hv.update_feature_lbr(cpu, true, 0)?;
        }
        Ok(())
    }

    /// Drop an LBR reference; the mirror of [`Self::lbr_enable`].
    pub fn lbr_disable(&self, cpu: Option<u32>) -> Result<()> {
        self.check_lbr_supported()?;
        let mut disable = false;
        {
            let mut counters = self.lbr_enabled.borrow_mut();
            match cpu {
                None => {
                    if counters.iter().any(|counter| *counter == 0) {
                        return Err(Error::InvalidRequest(
                            "lbr_disable without a matching lbr_enable".to_string(),
                        ));
                    }
                    for counter in counters.iter_mut() {
                        *counter -= 1;
                        if *counter == 0 {
                            disable = true;
                        }
                    }
                }
                Some(cpu) => {
                    let counter = counters
                        .get_mut(cpu as usize)
                        .ok_or_else(|| Error::InvalidRequest(format!("no cpu {cpu}")))?;
                    if *counter == 0 {
                        return Err(Error::InvalidRequest(
                            "lbr_disable without a matching lbr_enable".to_string(),
                        ));
                    }
                    *counter -= 1;
                    disable = *counter == 0;
                }
            }
        }
        if disable {
            self.hv.update_feature_lbr(cpu, false, 0)?;
        }
        Ok(())
    }

    /// LBR snapshot for a CPU, memoized within the stop.
    pub fn lbr(&self, cpu: u32) -> Result<Rc<LbrState>> {
        self.check_lbr_supported()?;
        let enabled = self
            .lbr_enabled
            .borrow()
            .get(cpu as usize)
            .copied()
            .unwrap_or(0);
        if enabled == 0 {
            return Err(Error::InvalidRequest(format!(
                "LBR was never enabled for cpu {cpu}"
            )));
        }
        if let Some(state) = self.lbrs.borrow().get(&cpu) {
            return Ok(Rc::clone(state));
        }
        let state = Rc::new(self.hv.lbr_state(cpu)?);
        self.lbrs.borrow_mut().insert(cpu, Rc::clone(&state));
        Ok(state)
    }

    pub fn request_stop(&self) -> Result<()> {
        self.hv.request_stop()
    }

    pub fn request_shutdown(&self) -> Result<()> {
        self.hv.request_shutdown()
    }

    fn invalidate_caches(&self) {
        self.cpus.borrow_mut().clear();
        self.lbrs.borrow_mut().clear();
    }
}

impl Plugin for VirtualMachine {
    fn name(&self) -> &str {
        NAME
    }

    fn uninit(&self) -> Result<()> {
        if let Some(hook) = self.hook.take() {
            self.em.remove_continue_hook(hook)?;
        }
        self.services.unregister_by_name(NAME)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FeatureCall, TestRig};

    #[test]
    fn cpu_state_memoized_until_continue_hook() {
        let rig = TestRig::x86(2);
        rig.hv.set_rip(0, 0x1000);

        let vm = rig.vm();
        assert_eq!(vm.cpu(0).unwrap().instruction_pointer(), 0x1000);

        // A new value is not observed while the cache is warm.
        rig.hv.set_rip(0, 0x2000);
        assert_eq!(vm.cpu(0).unwrap().instruction_pointer(), 0x1000);

        rig.em().call_continue_hooks();
        assert_eq!(vm.cpu(0).unwrap().instruction_pointer(), 0x2000);
    }

    #[test]
    fn cpu_out_of_range_fails() {
        let rig = TestRig::x86(1);
        assert!(matches!(
            rig.vm().cpu(1).unwrap_err(),
            Error::InvalidRequest(_)
        ));
    }

    #[test]
    fn vtop_prefers_explicit_dtb() {
        let rig = TestRig::x86(1);
        rig.hv.set_cr3(0, 0xaaaa_0000);
        rig.hv.map_page(0x4000, 0xaaaa_0000, 0x10_0000);
        rig.hv.map_page(0x4000, 0xbbbb_0000, 0x20_0000);

        let vm = rig.vm();
        assert_eq!(vm.vtop(0x4123, None, None).unwrap(), 0x10_0123);
        assert_eq!(vm.vtop(0x4123, Some(0xbbbb_0000), None).unwrap(), 0x20_0123);
    }

    #[test]
    fn vtop_failure_surfaces_translation_error() {
        let rig = TestRig::x86(1);
        rig.hv.set_cr3(0, 0xaaaa_0000);
        assert!(matches!(
            rig.vm().vtop(0x4000, None, None).unwrap_err(),
            Error::Translation { .. }
        ));
    }

    #[test]
    fn mem_read_crosses_page_boundaries() {
        let rig = TestRig::x86(1);
        rig.hv.set_cr3(0, 0xaaaa_0000);
        // Two virtually contiguous pages mapped to distant frames.
        rig.hv.map_page(0x4000, 0xaaaa_0000, 0x10_0000);
        rig.hv.map_page(0x5000, 0xaaaa_0000, 0x30_0000);
        rig.hv.write_phys(0x10_0ffe, &[0x11, 0x22]);
        rig.hv.write_phys(0x30_0000, &[0x33, 0x44]);

        let data = rig.vm().mem_read(0x4ffe, 4, None, None).unwrap();
        assert_eq!(data, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn mem_write_crosses_page_boundaries() {
        let rig = TestRig::x86(1);
        rig.hv.set_cr3(0, 0xaaaa_0000);
        rig.hv.map_page(0x4000, 0xaaaa_0000, 0x10_0000);
        rig.hv.map_page(0x5000, 0xaaaa_0000, 0x30_0000);

        let vm = rig.vm();
        vm.mem_write(0x4fff, &[0xde, 0xad], None, None).unwrap();
        assert_eq!(rig.hv.read_phys(0x10_0fff, 1), vec![0xde]);
        assert_eq!(rig.hv.read_phys(0x30_0000, 1), vec![0xad]);
    }

    #[test]
    fn read_pointer_is_little_endian() {
        let rig = TestRig::x86(1);
        rig.hv.set_cr3(0, 0xaaaa_0000);
        rig.hv.map_page(0x4000, 0xaaaa_0000, 0x10_0000);
        rig.hv
            .write_phys(0x10_0010, &[0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0]);

        let value = rig.vm().read_pointer(0x4010, None, None).unwrap();
        assert_eq!(value, 0x1234_5678);
    }

    #[test]
    fn lbr_refcount_balances_to_one_toggle_each_way() {
        let rig = TestRig::x86(2);
        let vm = rig.vm();

        for _ in 0..3 {
            vm.lbr_enable(None).unwrap();
        }
        for _ in 0..3 {
            vm.lbr_disable(None).unwrap();
        }

        let lbr_calls: Vec<_> = rig
            .hv
            .feature_calls()
            .into_iter()
            .filter(|call| matches!(call, FeatureCall::Lbr { .. }))
            .collect();
        assert_eq!(
            lbr_calls,
            vec![
                FeatureCall::Lbr {
                    cpu: None,
                    enable: true,
                },
                FeatureCall::Lbr {
                    cpu: None,
                    enable: false,
                },
            ]
        );
    }

    #[test]
    fn lbr_disable_without_enable_fails() {
        let rig = TestRig::x86(1);
        assert!(matches!(
            rig.vm().lbr_disable(None).unwrap_err(),
            Error::InvalidRequest(_)
        ));
    }

    #[test]
    fn lbr_snapshot_requires_enable_and_is_memoized() {
        let rig = TestRig::x86(1);
        let vm = rig.vm();
        assert!(vm.lbr(0).is_err());

        vm.lbr_enable(Some(0)).unwrap();
        let first = vm.lbr(0).unwrap();
        let second = vm.lbr(0).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(rig.hv.lbr_reads(), 1);

        rig.em().call_continue_hooks();
        let _ = vm.lbr(0).unwrap();
        assert_eq!(rig.hv.lbr_reads(), 2);
    }

    #[test]
    fn lbr_unsupported_on_aarch64() {
        let rig = TestRig::aarch64(1);
        assert!(matches!(
            rig.vm().lbr_enable(None).unwrap_err(),
            Error::Feature(_)
        ));
    }
}
