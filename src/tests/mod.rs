mod analysis;
mod support;
