/// Receives notifications about pages that may hold translated code.
///
/// The address space calls [`CodeRegistrationHook::page_promoted`] when a bulk copy lands on
/// unconnected memory and a fresh code-tracked page is installed there, and
/// [`CodeRegistrationHook::code_page_written`] for every write that reaches a code-tracked page so
/// that stale translations can be discarded.
pub trait CodeRegistrationHook {
    fn page_promoted(&mut self, block_base: u32);

    fn code_page_written(&mut self, _addr: u32, _len: usize) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCodeHook;

impl CodeRegistrationHook for NoopCodeHook {
    fn page_promoted(&mut self, _block_base: u32) {}
}
