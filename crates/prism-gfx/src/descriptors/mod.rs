pub mod descriptor_pool;
