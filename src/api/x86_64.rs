//! x86-64 specific guest state

const CR0_PG: u64 = 1 << 31;
const EFER_LMA: u64 = 1 << 10;
const CR3_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Register snapshot of an x86-64 vCPU.
#[derive(Debug, Clone, Default)]
pub struct X86CpuState {
    pub cpu: u32,

    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,

    pub fs_base: u64,
    pub gs_base: u64,
    pub kernel_gs_base: u64,
}

impl X86CpuState {
    pub fn page_table_base(&self) -> u64 {
        self.cr3 & CR3_ADDR_MASK
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    pub fn long_mode(&self) -> bool {
        self.efer & EFER_LMA != 0
    }

    pub fn pointer_width(&self) -> usize {
        if self.long_mode() {
            8
        } else {
            4
        }
    }
}

/// Snapshot of the last branch record ring.
///
/// `tos` indexes the most recent entry; `from`/`to` hold the branch source
/// and destination addresses in hardware order.
#[derive(Debug, Clone)]
pub struct LbrState {
    pub tos: u32,
    pub from: Vec<u64>,
    pub to: Vec<u64>,
}

impl LbrState {
    pub fn len(&self) -> usize {
        self.from.len().min(self.to.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Branches in ring order starting at the top of stack.
    pub fn branches(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let size = self.len();
        (0..size).map(move |i| {
            let cur = (self.tos as usize + i) % size;
            (self.from[cur], self.to[cur])
        })
    }
}
