use crate::packet2::Packet;

/// Observes the decoded packet stream alongside the battle controller.
pub trait Analyzer {
    fn process(&mut self, packet: &Packet<'_>);
    fn finish(&mut self);
}
