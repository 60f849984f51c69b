//! End-to-end flows over the scripted backend.

#[cfg(test)]
mod unit;
