/// An opaque identifier a caller associates with a registered handle.
///
/// `Token` carries no meaning to the runtime beyond round-tripping through
/// [`Event::token`](crate::Event::token); callers typically use it as a key
/// into their own handle table. `Token(usize::MAX)` is reserved for internal
/// use (the loop's own wake source) and must never be handed to
/// [`backend::Backend::register`](crate::backend::Backend::register).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Token {
    /// Reserved for the loop's internal wake registration; never issued to
    /// callers and rejected by registration if passed explicitly.
    pub const RESERVED: Token = Token(usize::MAX);
}

impl From<Token> for usize {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl From<usize> for Token {
    fn from(val: usize) -> Self {
        Token(val)
    }
}
