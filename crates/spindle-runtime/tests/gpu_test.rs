//! End-to-end tests on the wgpu backend.
//!
//! All tests need an adapter and skip when none is available.

mod common;

use common::{binary_program, f32_bytes, i32_bytes, init_tracing, to_f32, to_i32};
use spindle_core::{BinaryOp, ElementType, Program, Shape};
use spindle_runtime::{
    Argument, DeviceBuffer, DeviceClient, ErrorKind, ExecutableBuildOptions, GpuBackend,
    GpuOptions,
};

async fn gpu_client() -> Option<DeviceClient> {
    init_tracing();
    match GpuBackend::new(&GpuOptions::default()).await {
        Ok(backend) => {
            println!(
                "GPU: {} ({:?})",
                backend.adapter_info().name,
                backend.adapter_info().backend
            );
            Some(DeviceClient::from_backend(Box::new(backend)))
        }
        Err(e) => {
            eprintln!("Skipping test: no GPU adapter ({e})");
            None
        }
    }
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_add_f32_e2e() {
    let Some(client) = gpu_client().await else {
        return;
    };
    let (program, shapes) = binary_program(BinaryOp::Add, ElementType::F32, &[4]);
    let executable = client
        .compile(&program, &shapes, ExecutableBuildOptions::default(), false)
        .expect("compilation should succeed");
    assert_eq!(executable.fingerprint(), None);

    let a = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);
    let b = f32_bytes(&[5.0, 6.0, 7.0, 8.0]);
    let outputs = executable
        .run(
            &[
                Argument::Host { data: &a, shape: &shapes[0] },
                Argument::Host { data: &b, shape: &shapes[1] },
            ],
            false,
            None,
            &mut Vec::<DeviceBuffer>::new(),
        )
        .expect("execution should succeed");
    assert_eq!(to_f32(outputs[0].as_binary().unwrap()), vec![6.0, 8.0, 10.0, 12.0]);
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_integer_division_by_zero() {
    let Some(client) = gpu_client().await else {
        return;
    };
    let (program, shapes) = binary_program(BinaryOp::Div, ElementType::S32, &[3]);
    let executable = client
        .compile(&program, &shapes, ExecutableBuildOptions::default(), false)
        .unwrap();
    let a = i32_bytes(&[7, -9, 5]);
    let b = i32_bytes(&[2, 3, 0]);
    let outputs = executable
        .run(
            &[
                Argument::Host { data: &a, shape: &shapes[0] },
                Argument::Host { data: &b, shape: &shapes[1] },
            ],
            false,
            None,
            &mut Vec::<DeviceBuffer>::new(),
        )
        .unwrap();
    assert_eq!(to_i32(outputs[0].as_binary().unwrap()), vec![3, -3, -1]);
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_large_chained_program() {
    let Some(client) = gpu_client().await else {
        return;
    };
    // Large enough to need a two-dimensional dispatch.
    let n = 256 * 70_000;
    let program = Program::parse(&format!(
        "program chain
         %0 = parameter(0) f32[{n}]
         %1 = mul(%0, %0) f32[{n}]
         %2 = sub(%1, %0) f32[{n}]
         root %2"
    ))
    .unwrap();
    let shape = Shape::array(ElementType::F32, vec![n]);
    let executable = client
        .compile(&program, &[shape.clone()], ExecutableBuildOptions::default(), false)
        .unwrap();

    let input: Vec<f32> = (0..n).map(|i| (i % 7) as f32).collect();
    let data = f32_bytes(&input);
    let outputs = executable
        .run(
            &[Argument::Host { data: &data, shape: &shape }],
            true,
            None,
            &mut Vec::<DeviceBuffer>::new(),
        )
        .unwrap();
    let result = outputs[0].as_buffer().unwrap();
    let values = to_f32(&result.to_binary(None).unwrap());
    assert_eq!(values.len(), n);
    for (i, value) in values.iter().enumerate().step_by(9973) {
        let x = input[i];
        assert_eq!(*value, x * x - x, "mismatch at {i}");
    }
    result.deallocate().unwrap();
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_memory_limit_is_enforced() {
    init_tracing();
    let options = GpuOptions {
        memory_limit: Some(64),
        ..Default::default()
    };
    let Ok(backend) = GpuBackend::new(&options).await else {
        eprintln!("Skipping test: no GPU adapter");
        return;
    };
    let client = DeviceClient::from_backend(Box::new(backend));
    let small = Shape::array(ElementType::F32, vec![8]);
    let buffer = client
        .buffer_from_host(&f32_bytes(&[0.0; 8]), &small, 0, false)
        .unwrap();

    let err = client
        .buffer_from_host(&f32_bytes(&[0.0; 16]), &Shape::array(ElementType::F32, vec![16]), 0, false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);

    // Releasing the first buffer frees its share of the budget.
    buffer.deallocate().unwrap();
    client
        .buffer_from_host(&f32_bytes(&[0.0; 16]), &Shape::array(ElementType::F32, vec![16]), 0, false)
        .unwrap();
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_unsupported_element_type_fails_to_compile() {
    let Some(client) = gpu_client().await else {
        return;
    };
    let (program, shapes) = binary_program(BinaryOp::Add, ElementType::F64, &[2]);
    let err = client
        .compile(&program, &shapes, ExecutableBuildOptions::default(), false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
}
