//! Measurement recording and posting: the Sampler/Compressor/Recorder task
//! (§4.3) and the Post Worker task (§4.5).

pub mod post_worker;
pub mod sampler;
