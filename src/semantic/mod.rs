pub mod swizzle;
