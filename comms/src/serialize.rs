/// Types that can be written onto the wire.
pub trait Serialize<'a> {
    /// Writes the owned part of `self` into `buf`.
    ///
    /// # Returns
    /// An optional borrowed slice that must be written right after `buf`,
    /// this avoids copying large payloads into the staging buffer.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
