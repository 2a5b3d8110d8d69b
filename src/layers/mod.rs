pub mod activation;

pub mod attention;

pub mod build_module;

pub mod embeddings;

pub mod feedforward;

pub mod head;

pub mod layer_norm;

pub mod recurrent;
