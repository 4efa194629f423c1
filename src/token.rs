/// Associates readiness events and arena slots with handles.
///
/// `Token` is a wrapper around `usize`. It is the identity the event loop
/// hands to the OS selector when registering a file descriptor, and the key
/// of the handle's slot in the loop's arena. The loop assigns tokens itself;
/// user code only ever sees them embedded inside handle values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
