//! Marshaling benchmarks
//!
//! Measures argument packing and dtype codecs, which run on every call
//! regardless of what the native side does.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ostar_ffi::ffi::{CFuncFinalizer, DLManagedTensor, PackedCFunc, RetValueHandle};
use ostar_ffi::interop::RawHandle;
use ostar_ffi::{marshal, Context, DataType, Device, HostValue, NativeApi, NativeError, TypeTag, WireValue};
use std::ffi::c_void;
use std::sync::Arc;

type NativeResult<T> = std::result::Result<T, NativeError>;

/// Runtime stand-in; none of the measured paths reach it
struct NullApi;

fn absent<T>() -> NativeResult<T> {
    Err(NativeError::new("no native runtime in benchmarks"))
}

impl NativeApi for NullApi {
    fn func_call(&self, _: RawHandle, _: &mut [WireValue], _: &mut [TypeTag]) -> NativeResult<(WireValue, TypeTag)> {
        absent()
    }
    fn func_free(&self, _: RawHandle) -> NativeResult<()> {
        Ok(())
    }
    fn func_create_from_cfunc(&self, _: PackedCFunc, _: *mut c_void, _: CFuncFinalizer) -> NativeResult<RawHandle> {
        absent()
    }
    fn cfunc_set_return(&self, _: RetValueHandle, _: &mut [WireValue], _: &mut [TypeTag]) -> NativeResult<()> {
        absent()
    }
    fn cb_arg_to_return(&self, _: &mut WireValue, _: TypeTag) -> NativeResult<()> {
        absent()
    }
    fn object_free(&self, _: RawHandle) -> NativeResult<()> {
        Ok(())
    }
    fn object_type_index(&self, _: RawHandle) -> NativeResult<u32> {
        absent()
    }
    fn object_type_key_to_index(&self, _: &str) -> NativeResult<u32> {
        absent()
    }
    fn array_alloc(&self, _: &[i64], _: DataType, _: Device) -> NativeResult<RawHandle> {
        absent()
    }
    fn array_free(&self, _: RawHandle) -> NativeResult<()> {
        Ok(())
    }
    fn array_copy_from_to(&self, _: RawHandle, _: RawHandle) -> NativeResult<()> {
        absent()
    }
    fn array_to_dlpack(&self, _: RawHandle) -> NativeResult<*mut DLManagedTensor> {
        absent()
    }
    fn array_from_dlpack(&self, _: *mut DLManagedTensor) -> NativeResult<RawHandle> {
        absent()
    }
    fn array_type_index(&self, _: RawHandle) -> NativeResult<u32> {
        absent()
    }
    fn dl_managed_tensor_call_deleter(&self, _: *mut DLManagedTensor) {}
    fn module_free(&self, _: RawHandle) -> NativeResult<()> {
        Ok(())
    }
    fn func_register_global(&self, _: &str, _: RawHandle, _: bool) -> NativeResult<()> {
        absent()
    }
    fn func_get_global(&self, _: &str) -> NativeResult<RawHandle> {
        Ok(std::ptr::null_mut())
    }
    fn func_remove_global(&self, _: &str) -> NativeResult<()> {
        absent()
    }
    fn func_list_global_names(&self) -> NativeResult<Vec<String>> {
        Ok(Vec::new())
    }
    fn set_last_error(&self, _: &str) {}
}

fn context() -> Arc<Context> {
    let api: Arc<dyn NativeApi> = Arc::new(NullApi);
    Context::new(api)
}

fn bench_marshal_scalars(c: &mut Criterion) {
    let ctx = context();
    let mut group = c.benchmark_group("marshal_scalars");

    for n in [1, 4, 16, 64] {
        let args: Vec<HostValue> = (0..n)
            .map(|i| match i % 3 {
                0 => HostValue::Int(i as i64),
                1 => HostValue::Float(i as f64),
                _ => HostValue::Device(Device::cpu(i as i32)),
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &args, |b, args| {
            b.iter(|| black_box(marshal(&ctx, black_box(args)).map(|p| p.len())))
        });
    }

    group.finish();
}

fn bench_marshal_buffers(c: &mut Criterion) {
    let ctx = context();
    let mut group = c.benchmark_group("marshal_buffers");

    for size in [16usize, 1024, 65536] {
        let strs = vec![HostValue::Str("x".repeat(size))];
        let bytes = vec![HostValue::Bytes(vec![7u8; size])];
        group.bench_with_input(BenchmarkId::new("str", size), &strs, |b, args| {
            b.iter(|| black_box(marshal(&ctx, black_box(args)).map(|p| p.keep_alive_len())))
        });
        group.bench_with_input(BenchmarkId::new("bytes", size), &bytes, |b, args| {
            b.iter(|| black_box(marshal(&ctx, black_box(args)).map(|p| p.keep_alive_len())))
        });
    }

    group.finish();
}

fn bench_dtype_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("dtype");
    let names = ["bool", "int32", "float16x4", "uint8", "bfloat16"];

    group.bench_function("parse", |b| {
        b.iter(|| {
            for name in names {
                black_box(name.parse::<DataType>().ok());
            }
        })
    });

    let dtypes: Vec<DataType> = names.iter().filter_map(|n| n.parse().ok()).collect();
    group.bench_function("format", |b| {
        b.iter(|| {
            for dtype in &dtypes {
                black_box(dtype.to_string());
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_marshal_scalars, bench_marshal_buffers, bench_dtype_codec);
criterion_main!(benches);
