pub mod bindings;
pub mod events;
pub mod libbpf;
pub mod maps;
