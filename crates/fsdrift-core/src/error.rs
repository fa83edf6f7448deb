use std::error::Error;

/// Walk a wrapped error chain to the innermost cause and return its
/// message. The two sides of an executed operation wrap errors differently
/// (the reference walks subtrees, the SUT answers over a control channel),
/// so only the terminal message is meaningful for equality.
pub fn root_cause(err: &(dyn Error + 'static)) -> String {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}
